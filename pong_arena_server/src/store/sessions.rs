use std::collections::HashMap;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::util::now_secs;

/// A live login session. Tokens name a session id; revoking the session
/// invalidates every token minted for it.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub created_at: u64,
    pub expires_at: u64,
    pub revoked: bool,
}

pub struct SessionStore {
    inner: RwLock<HashMap<Uuid, SessionRecord>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub async fn create(&self, user_id: Uuid, ttl_secs: u64) -> SessionRecord {
        let now = now_secs();
        let record = SessionRecord {
            id: Uuid::new_v4(),
            user_id,
            created_at: now,
            expires_at: now + ttl_secs,
            revoked: false,
        };
        self.inner.write().await.insert(record.id, record.clone());
        record
    }

    pub async fn revoke(&self, id: Uuid) -> bool {
        match self.inner.write().await.get_mut(&id) {
            Some(record) => {
                record.revoked = true;
                true
            }
            None => false,
        }
    }

    /// True iff the session exists, belongs to `user_id`, is not revoked and
    /// has not expired.
    pub async fn is_live(&self, id: Uuid, user_id: Uuid) -> bool {
        match self.inner.read().await.get(&id) {
            Some(record) => {
                record.user_id == user_id && !record.revoked && record.expires_at > now_secs()
            }
            None => false,
        }
    }
}
