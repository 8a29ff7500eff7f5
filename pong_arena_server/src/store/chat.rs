use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::CoreError;
use crate::util::now_ms;
use shared::MAX_CHAT_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRecord {
    pub id: Uuid,
    pub slug: String,
    pub title: String,
    pub visibility: Visibility,
    pub created_by: Uuid,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Channel,
    Dm,
}

/// A persisted chat message; the hub fans out the saved id and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageRecord {
    pub id: Uuid,
    pub channel_id: Option<Uuid>,
    pub sender_id: Uuid,
    pub content: String,
    pub kind: MessageKind,
    pub dm_target_id: Option<Uuid>,
    pub created_at: u64,
}

#[derive(Debug, Clone)]
pub struct BlockRecord {
    pub blocker_id: Uuid,
    pub blocked_id: Uuid,
    pub reason: Option<String>,
    pub created_at: u64,
}

#[derive(Default)]
struct ChatTables {
    channels: HashMap<String, ChannelRecord>,
    memberships: HashMap<Uuid, HashSet<Uuid>>,
    messages: Vec<ChatMessageRecord>,
    blocks: HashMap<(Uuid, Uuid), BlockRecord>,
}

pub struct ChatRepo {
    inner: RwLock<ChatTables>,
}

impl ChatRepo {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(ChatTables::default()),
        }
    }

    /// Get or create a channel by slug, enrolling the user as a member.
    pub async fn join(&self, slug: &str, user_id: Uuid) -> Result<ChannelRecord, CoreError> {
        if slug.is_empty() || slug.len() > 64 {
            return Err(CoreError::Validation("invalid channel slug".into()));
        }
        let mut tables = self.inner.write().await;
        let channel = tables
            .channels
            .entry(slug.to_string())
            .or_insert_with(|| ChannelRecord {
                id: Uuid::new_v4(),
                slug: slug.to_string(),
                title: slug.to_string(),
                visibility: Visibility::Public,
                created_by: user_id,
                created_at: now_ms(),
            })
            .clone();
        tables
            .memberships
            .entry(channel.id)
            .or_default()
            .insert(user_id);
        Ok(channel)
    }

    pub async fn is_member(&self, slug: &str, user_id: Uuid) -> bool {
        let tables = self.inner.read().await;
        match tables.channels.get(slug) {
            Some(channel) => tables
                .memberships
                .get(&channel.id)
                .map(|m| m.contains(&user_id))
                .unwrap_or(false),
            None => false,
        }
    }

    pub async fn append_channel_message(
        &self,
        slug: &str,
        sender_id: Uuid,
        content: &str,
    ) -> Result<ChatMessageRecord, CoreError> {
        validate_body(content)?;
        let mut tables = self.inner.write().await;
        let channel = tables
            .channels
            .get(slug)
            .ok_or_else(|| CoreError::NotFound(format!("channel {slug}")))?;
        let member = tables
            .memberships
            .get(&channel.id)
            .map(|m| m.contains(&sender_id))
            .unwrap_or(false);
        if !member {
            return Err(CoreError::Unauthorized("not a channel member".into()));
        }
        let record = ChatMessageRecord {
            id: Uuid::new_v4(),
            channel_id: Some(channel.id),
            sender_id,
            content: content.to_string(),
            kind: MessageKind::Channel,
            dm_target_id: None,
            created_at: now_ms(),
        };
        tables.messages.push(record.clone());
        Ok(record)
    }

    pub async fn append_dm(
        &self,
        sender_id: Uuid,
        target_id: Uuid,
        content: &str,
    ) -> Result<ChatMessageRecord, CoreError> {
        validate_body(content)?;
        let record = ChatMessageRecord {
            id: Uuid::new_v4(),
            channel_id: None,
            sender_id,
            content: content.to_string(),
            kind: MessageKind::Dm,
            dm_target_id: Some(target_id),
            created_at: now_ms(),
        };
        self.inner.write().await.messages.push(record.clone());
        Ok(record)
    }

    pub async fn block(
        &self,
        blocker_id: Uuid,
        blocked_id: Uuid,
        reason: Option<String>,
    ) -> Result<(), CoreError> {
        if blocker_id == blocked_id {
            return Err(CoreError::Validation("cannot block yourself".into()));
        }
        self.inner.write().await.blocks.insert(
            (blocker_id, blocked_id),
            BlockRecord {
                blocker_id,
                blocked_id,
                reason,
                created_at: now_ms(),
            },
        );
        Ok(())
    }

    pub async fn unblock(&self, blocker_id: Uuid, blocked_id: Uuid) {
        self.inner
            .write()
            .await
            .blocks
            .remove(&(blocker_id, blocked_id));
    }

    /// Symmetric block filter: true if either party blocked the other.
    pub async fn is_blocked_either(&self, a: Uuid, b: Uuid) -> bool {
        let tables = self.inner.read().await;
        tables.blocks.contains_key(&(a, b)) || tables.blocks.contains_key(&(b, a))
    }
}

fn validate_body(content: &str) -> Result<(), CoreError> {
    if content.is_empty() {
        return Err(CoreError::Validation("empty message".into()));
    }
    if content.chars().count() > MAX_CHAT_LEN {
        return Err(CoreError::Validation("message too long".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn block_filter_is_symmetric() {
        let repo = ChatRepo::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(!repo.is_blocked_either(a, b).await);
        repo.block(a, b, None).await.unwrap();
        assert!(repo.is_blocked_either(a, b).await);
        assert!(repo.is_blocked_either(b, a).await);
        repo.unblock(a, b).await;
        assert!(!repo.is_blocked_either(a, b).await);
    }

    #[tokio::test]
    async fn channel_messages_require_membership() {
        let repo = ChatRepo::new();
        let member = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        repo.join("lobby", member).await.unwrap();
        assert!(repo
            .append_channel_message("lobby", member, "hi")
            .await
            .is_ok());
        assert!(matches!(
            repo.append_channel_message("lobby", stranger, "hi").await,
            Err(CoreError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn oversized_body_rejected() {
        let repo = ChatRepo::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let long = "x".repeat(MAX_CHAT_LEN + 1);
        assert!(matches!(
            repo.append_dm(a, b, &long).await,
            Err(CoreError::Validation(_))
        ));
    }
}
