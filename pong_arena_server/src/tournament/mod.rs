pub mod coordinator;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::error::CoreError;
use crate::store::{Store, TournamentRecord};

pub use coordinator::{CoordinatorHandle, TournamentCmd};

/// Lazily spawns and indexes one coordinator task per tournament. All
/// announce/result/queue traffic for a tournament flows through its
/// coordinator, which gives every subscriber the same event order.
pub struct TournamentService {
    store: Arc<Store>,
    shutdown: broadcast::Sender<()>,
    coordinators: RwLock<HashMap<Uuid, CoordinatorHandle>>,
}

impl TournamentService {
    pub fn new(store: Arc<Store>, shutdown: broadcast::Sender<()>) -> Self {
        Self {
            store,
            shutdown,
            coordinators: RwLock::new(HashMap::new()),
        }
    }

    pub async fn create(&self, name: String) -> Result<TournamentRecord, CoreError> {
        let record = self.store.tournaments.create(name).await?;
        tracing::info!(tournament_id = %record.id, "tournament created");
        Ok(record)
    }

    pub async fn get(&self, id: Uuid) -> Result<TournamentRecord, CoreError> {
        self.store
            .tournaments
            .get(id)
            .await
            .ok_or_else(|| CoreError::NotFound(format!("tournament {id}")))
    }

    /// Coordinator handle for a tournament, spawning the task on first use.
    pub async fn handle(&self, id: Uuid) -> Result<CoordinatorHandle, CoreError> {
        if !self.store.tournaments.exists(id).await {
            return Err(CoreError::NotFound(format!("tournament {id}")));
        }
        let mut map = self.coordinators.write().await;
        if let Some(handle) = map.get(&id) {
            return Ok(handle.clone());
        }
        let handle =
            coordinator::Coordinator::spawn(id, self.store.clone(), self.shutdown.clone());
        map.insert(id, handle.clone());
        Ok(handle)
    }

    /// Called by a match runtime when a tournament-bound match reaches a
    /// terminal state.
    pub async fn match_completed(
        &self,
        tournament_id: Uuid,
        match_id: Uuid,
        p1_score: u32,
        p2_score: u32,
        winner_user: Uuid,
    ) {
        match self.handle(tournament_id).await {
            Ok(handle) => {
                handle
                    .send(TournamentCmd::MatchCompleted {
                        match_id,
                        p1_score,
                        p2_score,
                        winner_user,
                    })
                    .await;
            }
            Err(err) => {
                tracing::warn!(tournament_id = %tournament_id, error = %err, "result for unknown tournament");
            }
        }
    }
}
