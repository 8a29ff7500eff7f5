use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::CoreError;
use crate::util::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TournamentStatus {
    Pending,
    Running,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TournamentMatchStatus {
    Pending,
    Announced,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TournamentPlayer {
    pub id: Uuid,
    pub tournament_id: Uuid,
    pub alias: String,
    pub user_id: Option<Uuid>,
    pub queued_at: Option<u64>,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TournamentMatch {
    pub id: Uuid,
    pub tournament_id: Uuid,
    pub p1_id: Uuid,
    pub p2_id: Uuid,
    pub order: u32,
    pub status: TournamentMatchStatus,
    pub winner_id: Option<Uuid>,
    pub p1_score: Option<u32>,
    pub p2_score: Option<u32>,
    /// Live pong match backing this pairing, when both players have accounts.
    pub match_id: Option<Uuid>,
    pub created_at: u64,
    pub announced_at: Option<u64>,
    pub completed_at: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TournamentRecord {
    pub id: Uuid,
    pub name: String,
    pub status: TournamentStatus,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub players: Vec<TournamentPlayer>,
    pub matches: Vec<TournamentMatch>,
}

pub struct TournamentRepo {
    inner: RwLock<HashMap<Uuid, TournamentRecord>>,
}

impl TournamentRepo {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub async fn create(&self, name: String) -> Result<TournamentRecord, CoreError> {
        if name.is_empty() || name.len() > 128 {
            return Err(CoreError::Validation("invalid tournament name".into()));
        }
        let record = TournamentRecord {
            id: Uuid::new_v4(),
            name,
            status: TournamentStatus::Pending,
            created_at: now_ms(),
            started_at: None,
            completed_at: None,
            players: Vec::new(),
            matches: Vec::new(),
        };
        self.inner.write().await.insert(record.id, record.clone());
        Ok(record)
    }

    pub async fn get(&self, id: Uuid) -> Option<TournamentRecord> {
        self.inner.read().await.get(&id).cloned()
    }

    pub async fn exists(&self, id: Uuid) -> bool {
        self.inner.read().await.contains_key(&id)
    }

    /// Apply a closure to one tournament under the write lock. The
    /// coordinator funnels every mutation through here, so each update is a
    /// single critical section.
    pub async fn mutate<T, F>(&self, id: Uuid, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(&mut TournamentRecord) -> Result<T, CoreError>,
    {
        let mut map = self.inner.write().await;
        let record = map
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("tournament {id}")))?;
        f(record)
    }
}
