use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::CoreError;
use crate::util::now_ms;

/// Durable lifecycle state of a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum MatchState {
    Waiting,
    Countdown,
    Playing,
    Paused,
    Ended,
    Forfeited,
}

impl MatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MatchState::Ended | MatchState::Forfeited)
    }
}

/// The durable match row. Never deleted; terminal rows are frozen.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatchRecord {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tournament_id: Option<Uuid>,
    pub p1_id: Uuid,
    pub p2_id: Uuid,
    pub p1_score: u32,
    pub p2_score: u32,
    pub winner_id: Option<Uuid>,
    pub state: MatchState,
    pub paused_by: Option<Uuid>,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub ended_at: Option<u64>,
}

impl MatchRecord {
    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.p1_id == user_id || self.p2_id == user_id
    }

    pub fn opponent_of(&self, user_id: Uuid) -> Option<Uuid> {
        if self.p1_id == user_id {
            Some(self.p2_id)
        } else if self.p2_id == user_id {
            Some(self.p1_id)
        } else {
            None
        }
    }
}

pub struct MatchRepo {
    inner: RwLock<HashMap<Uuid, MatchRecord>>,
}

impl MatchRepo {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub async fn create(
        &self,
        p1_id: Uuid,
        p2_id: Uuid,
        tournament_id: Option<Uuid>,
    ) -> Result<MatchRecord, CoreError> {
        if p1_id == p2_id {
            return Err(CoreError::Validation(
                "a match needs two distinct participants".into(),
            ));
        }
        let record = MatchRecord {
            id: Uuid::new_v4(),
            tournament_id,
            p1_id,
            p2_id,
            p1_score: 0,
            p2_score: 0,
            winner_id: None,
            state: MatchState::Waiting,
            paused_by: None,
            created_at: now_ms(),
            started_at: None,
            ended_at: None,
        };
        self.inner.write().await.insert(record.id, record.clone());
        Ok(record)
    }

    pub async fn get(&self, id: Uuid) -> Option<MatchRecord> {
        self.inner.read().await.get(&id).cloned()
    }

    /// Persist a non-terminal lifecycle transition. `started_at` is stamped on
    /// the first transition out of `waiting`. No-op once the row is terminal.
    pub async fn set_state(&self, id: Uuid, state: MatchState) -> Result<(), CoreError> {
        let mut map = self.inner.write().await;
        let record = map
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("match {id}")))?;
        if record.state.is_terminal() {
            return Ok(());
        }
        if record.started_at.is_none() && state != MatchState::Waiting {
            record.started_at = Some(now_ms());
        }
        record.state = state;
        if state != MatchState::Paused {
            record.paused_by = None;
        }
        Ok(())
    }

    pub async fn set_paused_by(&self, id: Uuid, by: Option<Uuid>) -> Result<(), CoreError> {
        let mut map = self.inner.write().await;
        let record = map
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("match {id}")))?;
        if !record.state.is_terminal() {
            record.paused_by = by;
        }
        Ok(())
    }

    /// Terminal write: freeze winner and scores. Idempotent; returns the row
    /// and whether this call performed the transition.
    pub async fn complete(
        &self,
        id: Uuid,
        state: MatchState,
        winner_id: Uuid,
        p1_score: u32,
        p2_score: u32,
    ) -> Result<(MatchRecord, bool), CoreError> {
        debug_assert!(state.is_terminal());
        let mut map = self.inner.write().await;
        let record = map
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("match {id}")))?;
        if record.state.is_terminal() {
            return Ok((record.clone(), false));
        }
        if !record.is_participant(winner_id) {
            return Err(CoreError::Validation(
                "winner must be one of the participants".into(),
            ));
        }
        let now = now_ms();
        record.state = state;
        record.winner_id = Some(winner_id);
        record.p1_score = p1_score;
        record.p2_score = p2_score;
        record.paused_by = None;
        record.ended_at = Some(now);
        if record.started_at.is_none() {
            record.started_at = Some(now);
        }
        Ok((record.clone(), true))
    }

    /// Completed matches of a user in chronological order.
    pub async fn completed_for(&self, user_id: Uuid) -> Vec<MatchRecord> {
        let map = self.inner.read().await;
        let mut rows: Vec<MatchRecord> = map
            .values()
            .filter(|m| m.state.is_terminal() && m.is_participant(user_id))
            .cloned()
            .collect();
        rows.sort_by_key(|m| (m.ended_at, m.created_at, m.id));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_is_idempotent_and_freezes() {
        let repo = MatchRepo::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let m = repo.create(a, b, None).await.unwrap();

        let (first, changed) = repo
            .complete(m.id, MatchState::Ended, a, 11, 3)
            .await
            .unwrap();
        assert!(changed);
        assert_eq!(first.winner_id, Some(a));

        let (second, changed) = repo
            .complete(m.id, MatchState::Forfeited, b, 0, 0)
            .await
            .unwrap();
        assert!(!changed);
        assert_eq!(second.winner_id, Some(a));
        assert_eq!((second.p1_score, second.p2_score), (11, 3));
        assert_eq!(second.state, MatchState::Ended);

        // terminal rows ignore later lifecycle writes
        repo.set_state(m.id, MatchState::Playing).await.unwrap();
        assert_eq!(repo.get(m.id).await.unwrap().state, MatchState::Ended);
    }

    #[tokio::test]
    async fn self_match_rejected() {
        let repo = MatchRepo::new();
        let a = Uuid::new_v4();
        assert!(repo.create(a, a, None).await.is_err());
    }

    #[tokio::test]
    async fn started_at_set_on_first_leave_from_waiting() {
        let repo = MatchRepo::new();
        let m = repo
            .create(Uuid::new_v4(), Uuid::new_v4(), None)
            .await
            .unwrap();
        assert!(repo.get(m.id).await.unwrap().started_at.is_none());
        repo.set_state(m.id, MatchState::Countdown).await.unwrap();
        let started = repo.get(m.id).await.unwrap().started_at;
        assert!(started.is_some());
        repo.set_state(m.id, MatchState::Playing).await.unwrap();
        assert_eq!(repo.get(m.id).await.unwrap().started_at, started);
    }
}
