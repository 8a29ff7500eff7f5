use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Win,
    Loss,
}

/// Aggregated win/loss row, one per user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    pub user_id: Uuid,
    pub wins: u32,
    pub losses: u32,
    pub streak: u32,
    pub last_result: Option<Outcome>,
    pub updated_at: u64,
}

/// Snapshot of one completed match from a user's perspective.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RecentMatch {
    pub id: Uuid,
    pub user_id: Uuid,
    pub opponent_user_id: Option<Uuid>,
    pub match_id: Uuid,
    pub p1_score: u32,
    pub p2_score: u32,
    pub outcome: Outcome,
    pub played_at: u64,
    pub created_at: u64,
}

#[derive(Default)]
struct StatsTables {
    stats: HashMap<Uuid, UserStats>,
    recent: HashMap<Uuid, Vec<RecentMatch>>,
}

pub struct StatsRepo {
    inner: RwLock<StatsTables>,
}

impl StatsRepo {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StatsTables::default()),
        }
    }

    /// Replace a user's stats row and recent-match list in one critical
    /// section. The aggregator recomputes both from scratch, so this is a
    /// full rewrite rather than a merge.
    pub async fn rewrite(&self, user_id: Uuid, stats: UserStats, recent: Vec<RecentMatch>) {
        let mut tables = self.inner.write().await;
        tables.stats.insert(user_id, stats);
        tables.recent.insert(user_id, recent);
    }

    pub async fn get(&self, user_id: Uuid) -> UserStats {
        self.inner
            .read()
            .await
            .stats
            .get(&user_id)
            .cloned()
            .unwrap_or(UserStats {
                user_id,
                wins: 0,
                losses: 0,
                streak: 0,
                last_result: None,
                updated_at: 0,
            })
    }

    pub async fn recent(&self, user_id: Uuid) -> Vec<RecentMatch> {
        self.inner
            .read()
            .await
            .recent
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }
}
