//! Stats aggregator: rebuilds a user's win/loss/streak row and recent-match
//! snapshots from their completed matches. Pure fold over the match history,
//! so rerunning on unchanged data rewrites identical rows.

use uuid::Uuid;

use crate::error::CoreError;
use crate::store::{MatchRecord, Outcome, RecentMatch, Store, UserStats};

/// How many recent matches are kept per user.
const RECENT_LIMIT: usize = 10;

pub async fn recompute_user(store: &Store, user_id: Uuid) -> Result<(), CoreError> {
    let history = store.matches.completed_for(user_id).await;

    let mut wins = 0u32;
    let mut losses = 0u32;
    let mut streak = 0u32;
    let mut last_result = None;

    for row in &history {
        match outcome_for(row, user_id) {
            Outcome::Win => {
                wins += 1;
                streak += 1;
                last_result = Some(Outcome::Win);
            }
            Outcome::Loss => {
                losses += 1;
                streak = 0;
                last_result = Some(Outcome::Loss);
            }
        }
    }

    let recent: Vec<RecentMatch> = history
        .iter()
        .rev()
        .take(RECENT_LIMIT)
        .map(|row| RecentMatch {
            // row identity is a function of its source so reruns rewrite
            // the exact same bytes
            id: Uuid::new_v5(&row.id, user_id.as_bytes()),
            user_id,
            opponent_user_id: row.opponent_of(user_id),
            match_id: row.id,
            p1_score: row.p1_score,
            p2_score: row.p2_score,
            outcome: outcome_for(row, user_id),
            played_at: row.ended_at.unwrap_or(row.created_at),
            created_at: row.ended_at.unwrap_or(row.created_at),
        })
        .collect();

    let updated_at = history
        .last()
        .map(|row| row.ended_at.unwrap_or(row.created_at))
        .unwrap_or(0);
    let stats = UserStats {
        user_id,
        wins,
        losses,
        streak,
        last_result,
        updated_at,
    };
    store.stats.rewrite(user_id, stats, recent).await;
    Ok(())
}

fn outcome_for(row: &MatchRecord, user_id: Uuid) -> Outcome {
    if row.winner_id == Some(user_id) {
        Outcome::Win
    } else {
        Outcome::Loss
    }
}
