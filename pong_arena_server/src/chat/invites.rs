//! Invitation broker: ephemeral match invites with a 30 second TTL.
//!
//! One task owns the invite set. An invite leaves the map exactly once, and
//! only the removal site decides which notification pair goes out, so the
//! accept/decline/timeout/disconnect paths are mutually exclusive.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use uuid::Uuid;

use shared::{CancelReason, ChatServerMessage, ErrorCode, INVITE_TTL_SECS};

use super::hub::HubHandle;
use crate::config::Config;
use crate::store::Store;
use crate::util::now_ms;

#[derive(Debug)]
pub enum BrokerCmd {
    Create {
        from: Uuid,
        to: Uuid,
    },
    Respond {
        user_id: Uuid,
        invite_id: Uuid,
        accepted: bool,
    },
    Expire {
        invite_id: Uuid,
    },
    UserDisconnected {
        user_id: Uuid,
    },
}

#[derive(Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<BrokerCmd>,
}

impl BrokerHandle {
    pub fn new(tx: mpsc::Sender<BrokerCmd>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, cmd: BrokerCmd) {
        if self.tx.send(cmd).await.is_err() {
            tracing::debug!("invite broker gone, command dropped");
        }
    }
}

#[derive(Debug, Clone)]
struct Invite {
    id: Uuid,
    from: Uuid,
    to: Uuid,
    expires_at: u64,
}

pub struct InviteBroker {
    cfg: Arc<Config>,
    store: Arc<Store>,
    hub: HubHandle,
    handle: BrokerHandle,
    invites: HashMap<Uuid, Invite>,
}

impl InviteBroker {
    pub fn spawn(
        rx: mpsc::Receiver<BrokerCmd>,
        handle: BrokerHandle,
        hub: HubHandle,
        cfg: Arc<Config>,
        store: Arc<Store>,
        shutdown: broadcast::Sender<()>,
    ) {
        let broker = InviteBroker {
            cfg,
            store,
            hub,
            handle,
            invites: HashMap::new(),
        };
        tokio::spawn(broker.run(rx, shutdown.subscribe()));
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<BrokerCmd>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
        }
        tracing::info!("invite broker stopped");
    }

    async fn handle(&mut self, cmd: BrokerCmd) {
        match cmd {
            BrokerCmd::Create { from, to } => self.on_create(from, to).await,
            BrokerCmd::Respond {
                user_id,
                invite_id,
                accepted,
            } => self.on_respond(user_id, invite_id, accepted).await,
            BrokerCmd::Expire { invite_id } => self.on_expire(invite_id).await,
            BrokerCmd::UserDisconnected { user_id } => self.on_user_disconnected(user_id).await,
        }
    }

    async fn on_create(&mut self, from: Uuid, to: Uuid) {
        if from == to {
            self.error(from, "cannot invite yourself").await;
            return;
        }
        if self
            .invites
            .values()
            .any(|i| i.from == from && i.to == to)
        {
            self.error(from, "invite already pending for this player").await;
            return;
        }
        let outstanding = self.invites.values().filter(|i| i.from == from).count();
        if outstanding >= self.cfg.max_pending_invites {
            self.hub
                .deliver(
                    from,
                    ChatServerMessage::Error {
                        error: ErrorCode::RateLimit,
                        message: "too many pending invites".into(),
                    },
                )
                .await;
            return;
        }

        let invite = Invite {
            id: Uuid::new_v4(),
            from,
            to,
            expires_at: now_ms() + INVITE_TTL_SECS * 1000,
        };
        self.invites.insert(invite.id, invite.clone());
        let invite_id = invite.id;
        let handle = self.handle.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(INVITE_TTL_SECS)).await;
            handle.send(BrokerCmd::Expire { invite_id }).await;
        });

        tracing::info!(invite_id = %invite.id, from = %from, to = %to, "match invite created");
        self.hub
            .deliver(
                from,
                ChatServerMessage::MatchInviteSent {
                    invite_id: invite.id,
                    to,
                    expires_at: invite.expires_at,
                },
            )
            .await;
        self.hub
            .deliver(
                to,
                ChatServerMessage::MatchInvite {
                    invite_id: invite.id,
                    from,
                    expires_at: invite.expires_at,
                },
            )
            .await;
    }

    async fn on_respond(&mut self, user_id: Uuid, invite_id: Uuid, accepted: bool) {
        let recipient_matches = self
            .invites
            .get(&invite_id)
            .map(|i| i.to == user_id)
            .unwrap_or(false);
        if !recipient_matches {
            self.error(user_id, "unknown invite").await;
            return;
        }
        let invite = match self.invites.remove(&invite_id) {
            Some(invite) => invite,
            None => return,
        };

        if !accepted {
            self.hub
                .deliver(
                    invite.from,
                    ChatServerMessage::MatchInviteDeclined { invite_id },
                )
                .await;
            self.hub
                .deliver(
                    invite.to,
                    ChatServerMessage::MatchInviteCancelled { invite_id },
                )
                .await;
            return;
        }

        match self.store.matches.create(invite.from, invite.to, None).await {
            Ok(record) => {
                tracing::info!(invite_id = %invite_id, match_id = %record.id, "invite accepted");
                self.hub
                    .deliver(
                        invite.from,
                        ChatServerMessage::MatchInviteAccepted {
                            invite_id,
                            match_id: record.id,
                        },
                    )
                    .await;
                self.hub
                    .deliver(
                        invite.to,
                        ChatServerMessage::MatchInviteConfirmed {
                            invite_id,
                            match_id: record.id,
                        },
                    )
                    .await;
            }
            Err(err) => {
                tracing::error!(invite_id = %invite_id, error = %err, "match creation failed");
                self.error(invite.to, "match creation failed").await;
            }
        }
    }

    async fn on_expire(&mut self, invite_id: Uuid) {
        if let Some(invite) = self.invites.remove(&invite_id) {
            self.expire_both(&invite, CancelReason::Timeout).await;
        }
    }

    async fn on_user_disconnected(&mut self, user_id: Uuid) {
        let gone: Vec<Uuid> = self
            .invites
            .values()
            .filter(|i| i.from == user_id || i.to == user_id)
            .map(|i| i.id)
            .collect();
        for id in gone {
            if let Some(invite) = self.invites.remove(&id) {
                self.expire_both(&invite, CancelReason::Disconnect).await;
            }
        }
    }

    async fn expire_both(&self, invite: &Invite, reason: CancelReason) {
        for user in [invite.from, invite.to] {
            self.hub
                .deliver(
                    user,
                    ChatServerMessage::MatchInviteExpired {
                        invite_id: invite.id,
                        reason,
                    },
                )
                .await;
        }
    }

    async fn error(&self, user_id: Uuid, message: &str) {
        self.hub
            .deliver(
                user_id,
                ChatServerMessage::MatchInviteError {
                    error: message.to_string(),
                },
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::spawn_chat;
    use super::*;
    use crate::config::Config;
    use crate::chat::hub::HubCmd;
    use crate::ws::{conn_channel, ConnTx};
    use tokio::time::timeout;

    async fn next_msg(rx: &mut mpsc::Receiver<String>) -> ChatServerMessage {
        let text = timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("timed out")
            .expect("closed");
        serde_json::from_str(&text).expect("valid frame")
    }

    async fn wait_for<F>(rx: &mut mpsc::Receiver<String>, mut pred: F) -> ChatServerMessage
    where
        F: FnMut(&ChatServerMessage) -> bool,
    {
        loop {
            let msg = next_msg(rx).await;
            if pred(&msg) {
                return msg;
            }
        }
    }

    struct Peer {
        user_id: Uuid,
        conn: ConnTx,
        rx: mpsc::Receiver<String>,
    }

    async fn connect(hub: &HubHandle, user_id: Uuid) -> Peer {
        let (conn, mut rx, _kill) = conn_channel();
        hub.send(HubCmd::Connect {
            user_id,
            conn: conn.clone(),
        })
        .await;
        wait_for(&mut rx, |m| matches!(m, ChatServerMessage::Welcome { .. })).await;
        Peer { user_id, conn, rx }
    }

    async fn send(hub: &HubHandle, peer: &Peer, msg: shared::ChatClientMessage) {
        hub.send(HubCmd::Client {
            user_id: peer.user_id,
            conn_id: peer.conn.id(),
            msg,
        })
        .await;
    }

    fn setup() -> (HubHandle, Arc<Store>) {
        let cfg = Arc::new(Config::for_tests());
        let store = Arc::new(Store::new());
        let (shutdown, _) = broadcast::channel(1);
        let (hub, _broker) = spawn_chat(cfg, store.clone(), shutdown);
        (hub, store)
    }

    #[tokio::test(start_paused = true)]
    async fn accepting_an_invite_creates_a_waiting_match() {
        let (hub, store) = setup();
        let mut a = connect(&hub, Uuid::new_v4()).await;
        let mut b = connect(&hub, Uuid::new_v4()).await;

        send(&hub, &b, shared::ChatClientMessage::MatchInvite { to: a.user_id }).await;

        let msg = wait_for(&mut a.rx, |m| {
            matches!(m, ChatServerMessage::MatchInvite { .. })
        })
        .await;
        let invite_id = match msg {
            ChatServerMessage::MatchInvite { invite_id, from, .. } => {
                assert_eq!(from, b.user_id);
                invite_id
            }
            _ => unreachable!(),
        };
        wait_for(&mut b.rx, |m| {
            matches!(m, ChatServerMessage::MatchInviteSent { .. })
        })
        .await;

        send(
            &hub,
            &a,
            shared::ChatClientMessage::MatchInviteResponse {
                invite_id,
                accepted: true,
            },
        )
        .await;

        let confirmed = wait_for(&mut a.rx, |m| {
            matches!(m, ChatServerMessage::MatchInviteConfirmed { .. })
        })
        .await;
        let accepted = wait_for(&mut b.rx, |m| {
            matches!(m, ChatServerMessage::MatchInviteAccepted { .. })
        })
        .await;
        let (m1, m2) = match (confirmed, accepted) {
            (
                ChatServerMessage::MatchInviteConfirmed { match_id: m1, .. },
                ChatServerMessage::MatchInviteAccepted { match_id: m2, .. },
            ) => (m1, m2),
            _ => unreachable!(),
        };
        assert_eq!(m1, m2);

        let row = store.matches.get(m1).await.unwrap();
        assert_eq!(row.state, crate::store::MatchState::Waiting);
        assert_eq!((row.p1_id, row.p2_id), (b.user_id, a.user_id));
    }

    #[tokio::test(start_paused = true)]
    async fn invite_expires_after_its_ttl() {
        let (hub, _store) = setup();
        let mut a = connect(&hub, Uuid::new_v4()).await;
        let mut b = connect(&hub, Uuid::new_v4()).await;

        send(&hub, &b, shared::ChatClientMessage::MatchInvite { to: a.user_id }).await;
        let (invite_id, expires_at) = match wait_for(&mut a.rx, |m| {
            matches!(m, ChatServerMessage::MatchInvite { .. })
        })
        .await
        {
            ChatServerMessage::MatchInvite {
                invite_id,
                expires_at,
                ..
            } => (invite_id, expires_at),
            _ => unreachable!(),
        };
        assert!(expires_at > 0);

        // nobody responds for 30 seconds
        let msg = wait_for(&mut b.rx, |m| {
            matches!(m, ChatServerMessage::MatchInviteExpired { .. })
        })
        .await;
        match msg {
            ChatServerMessage::MatchInviteExpired { invite_id: id, reason } => {
                assert_eq!(id, invite_id);
                assert_eq!(reason, CancelReason::Timeout);
            }
            _ => unreachable!(),
        }
        wait_for(&mut a.rx, |m| {
            matches!(m, ChatServerMessage::MatchInviteExpired { .. })
        })
        .await;

        // the invite no longer exists
        send(
            &hub,
            &a,
            shared::ChatClientMessage::MatchInviteResponse {
                invite_id,
                accepted: true,
            },
        )
        .await;
        let msg = wait_for(&mut a.rx, |m| {
            matches!(m, ChatServerMessage::MatchInviteError { .. })
        })
        .await;
        assert!(matches!(msg, ChatServerMessage::MatchInviteError { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn sender_disconnect_cancels_the_invite() {
        let (hub, _store) = setup();
        let mut a = connect(&hub, Uuid::new_v4()).await;
        let b = connect(&hub, Uuid::new_v4()).await;

        send(&hub, &b, shared::ChatClientMessage::MatchInvite { to: a.user_id }).await;
        wait_for(&mut a.rx, |m| {
            matches!(m, ChatServerMessage::MatchInvite { .. })
        })
        .await;

        hub.send(HubCmd::Disconnect {
            user_id: b.user_id,
            conn_id: b.conn.id(),
        })
        .await;

        let msg = wait_for(&mut a.rx, |m| {
            matches!(m, ChatServerMessage::MatchInviteExpired { .. })
        })
        .await;
        match msg {
            ChatServerMessage::MatchInviteExpired { reason, .. } => {
                assert_eq!(reason, CancelReason::Disconnect)
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn self_and_duplicate_invites_rejected() {
        let (hub, _store) = setup();
        let mut a = connect(&hub, Uuid::new_v4()).await;
        let mut b = connect(&hub, Uuid::new_v4()).await;

        send(&hub, &a, shared::ChatClientMessage::MatchInvite { to: a.user_id }).await;
        wait_for(&mut a.rx, |m| {
            matches!(m, ChatServerMessage::MatchInviteError { .. })
        })
        .await;

        send(&hub, &a, shared::ChatClientMessage::MatchInvite { to: b.user_id }).await;
        wait_for(&mut b.rx, |m| {
            matches!(m, ChatServerMessage::MatchInvite { .. })
        })
        .await;
        send(&hub, &a, shared::ChatClientMessage::MatchInvite { to: b.user_id }).await;
        let msg = wait_for(&mut a.rx, |m| {
            matches!(
                m,
                ChatServerMessage::MatchInviteError { .. } | ChatServerMessage::Error { .. }
            )
        })
        .await;
        assert!(matches!(msg, ChatServerMessage::MatchInviteError { .. }));
    }
}
