//! Chat hub: one task owning connections, channel membership, presence and
//! block state. Serializing every mutation through the command queue gives
//! per-topic message ordering for free.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use shared::{ChatClientMessage, ChatServerMessage};

use super::invites::BrokerHandle;
use crate::error::CoreError;
use crate::store::Store;
use crate::util::now_ms;
use crate::ws::ConnTx;

#[derive(Debug)]
pub enum HubCmd {
    Connect {
        user_id: Uuid,
        conn: ConnTx,
    },
    Disconnect {
        user_id: Uuid,
        conn_id: u64,
    },
    Client {
        user_id: Uuid,
        conn_id: u64,
        msg: ChatClientMessage,
    },
    /// Out-of-band delivery to every live socket of a user (invite broker).
    Deliver {
        user_id: Uuid,
        msg: ChatServerMessage,
    },
}

#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCmd>,
}

impl HubHandle {
    pub fn new(tx: mpsc::Sender<HubCmd>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, cmd: HubCmd) {
        if self.tx.send(cmd).await.is_err() {
            tracing::debug!("chat hub gone, command dropped");
        }
    }

    pub async fn deliver(&self, user_id: Uuid, msg: ChatServerMessage) {
        self.send(HubCmd::Deliver { user_id, msg }).await;
    }
}

pub struct ChatHub {
    store: Arc<Store>,
    broker: BrokerHandle,
    conns: HashMap<Uuid, Vec<ConnTx>>,
    rooms: HashMap<String, HashSet<Uuid>>,
    user_rooms: HashMap<Uuid, HashSet<String>>,
}

impl ChatHub {
    pub fn spawn(
        rx: mpsc::Receiver<HubCmd>,
        broker: BrokerHandle,
        store: Arc<Store>,
        shutdown: broadcast::Sender<()>,
    ) {
        let hub = ChatHub {
            store,
            broker,
            conns: HashMap::new(),
            rooms: HashMap::new(),
            user_rooms: HashMap::new(),
        };
        tokio::spawn(hub.run(rx, shutdown.subscribe()));
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<HubCmd>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                _ = shutdown.recv() => {
                    for conns in self.conns.values() {
                        for conn in conns {
                            conn.close(shared::close::NORMAL);
                        }
                    }
                    break;
                }
            }
        }
        tracing::info!("chat hub stopped");
    }

    async fn handle(&mut self, cmd: HubCmd) {
        match cmd {
            HubCmd::Connect { user_id, conn } => {
                conn.send_msg(&ChatServerMessage::Welcome { user_id });
                self.conns.entry(user_id).or_default().push(conn);
            }
            HubCmd::Disconnect { user_id, conn_id } => {
                self.on_disconnect(user_id, conn_id).await;
            }
            HubCmd::Client {
                user_id,
                conn_id,
                msg,
            } => {
                self.on_client(user_id, conn_id, msg).await;
            }
            HubCmd::Deliver { user_id, msg } => {
                self.deliver(user_id, &msg);
            }
        }
    }

    async fn on_disconnect(&mut self, user_id: Uuid, conn_id: u64) {
        let last_gone = match self.conns.get_mut(&user_id) {
            Some(conns) => {
                conns.retain(|c| c.id() != conn_id);
                conns.is_empty()
            }
            None => return,
        };
        if !last_gone {
            return;
        }
        self.conns.remove(&user_id);
        if let Some(rooms) = self.user_rooms.remove(&user_id) {
            for room in rooms {
                if let Some(members) = self.rooms.get_mut(&room) {
                    members.remove(&user_id);
                }
                self.broadcast_room(
                    &room,
                    &ChatServerMessage::Presence {
                        room: room.clone(),
                        user_id,
                        online: false,
                    },
                )
                .await;
            }
        }
        self.broker
            .send(super::invites::BrokerCmd::UserDisconnected { user_id })
            .await;
    }

    async fn on_client(&mut self, user_id: Uuid, conn_id: u64, msg: ChatClientMessage) {
        match msg {
            ChatClientMessage::Join { room } => self.on_join(user_id, conn_id, room).await,
            ChatClientMessage::Channel { room, body } => {
                self.on_channel(user_id, conn_id, room, body).await;
            }
            ChatClientMessage::Dm { to, body } => self.on_dm(user_id, conn_id, to, body).await,
            ChatClientMessage::MatchChat { match_id, body } => {
                self.on_match_chat(user_id, conn_id, match_id, body).await;
            }
            ChatClientMessage::MatchInvite { to } => {
                self.broker
                    .send(super::invites::BrokerCmd::Create { from: user_id, to })
                    .await;
            }
            ChatClientMessage::MatchInviteResponse {
                invite_id,
                accepted,
            } => {
                self.broker
                    .send(super::invites::BrokerCmd::Respond {
                        user_id,
                        invite_id,
                        accepted,
                    })
                    .await;
            }
            ChatClientMessage::Block {
                user_id: target,
                reason,
            } => {
                match self.store.chat.block(user_id, target, reason).await {
                    Ok(()) => self.reply(
                        user_id,
                        conn_id,
                        &ChatServerMessage::Blocked { user_id: target },
                    ),
                    Err(err) => self.reply_error(user_id, conn_id, &err),
                }
            }
            ChatClientMessage::Unblock { user_id: target } => {
                self.store.chat.unblock(user_id, target).await;
                self.reply(
                    user_id,
                    conn_id,
                    &ChatServerMessage::Unblocked { user_id: target },
                );
            }
            ChatClientMessage::Ping { .. } => {
                self.reply(user_id, conn_id, &ChatServerMessage::Pong { ts: now_ms() });
            }
        }
    }

    async fn on_join(&mut self, user_id: Uuid, conn_id: u64, room: String) {
        if let Err(err) = self.store.chat.join(&room, user_id).await {
            self.reply_error(user_id, conn_id, &err);
            return;
        }
        self.reply(user_id, conn_id, &ChatServerMessage::Joined { room: room.clone() });

        let newly_online = self.rooms.entry(room.clone()).or_default().insert(user_id);
        self.user_rooms
            .entry(user_id)
            .or_default()
            .insert(room.clone());
        // a user with several sockets counts once for presence
        if newly_online {
            self.broadcast_room(
                &room,
                &ChatServerMessage::Presence {
                    room: room.clone(),
                    user_id,
                    online: true,
                },
            )
            .await;
        }
    }

    async fn on_channel(&mut self, user_id: Uuid, conn_id: u64, room: String, body: String) {
        let record = match self
            .store
            .chat
            .append_channel_message(&room, user_id, &body)
            .await
        {
            Ok(record) => record,
            Err(err) => {
                self.reply_error(user_id, conn_id, &err);
                return;
            }
        };
        let msg = ChatServerMessage::Channel {
            from: user_id,
            room: room.clone(),
            content: record.content,
            timestamp: record.created_at,
        };
        let members: Vec<Uuid> = self
            .rooms
            .get(&room)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        for member in members {
            if member != user_id && self.store.chat.is_blocked_either(user_id, member).await {
                continue;
            }
            self.deliver(member, &msg);
        }
    }

    async fn on_dm(&mut self, user_id: Uuid, conn_id: u64, to: Uuid, body: String) {
        let record = match self.store.chat.append_dm(user_id, to, &body).await {
            Ok(record) => record,
            Err(err) => {
                self.reply_error(user_id, conn_id, &err);
                return;
            }
        };
        let msg = ChatServerMessage::Dm {
            from: user_id,
            user_id: to,
            content: record.content,
            timestamp: record.created_at,
        };
        if !self.store.chat.is_blocked_either(user_id, to).await {
            self.deliver(to, &msg);
        }
        self.deliver(user_id, &msg);
    }

    async fn on_match_chat(&mut self, user_id: Uuid, conn_id: u64, match_id: Uuid, body: String) {
        let record = match self.store.matches.get(match_id).await {
            Some(record) => record,
            None => {
                self.reply_error(
                    user_id,
                    conn_id,
                    &CoreError::NotFound(format!("match {match_id}")),
                );
                return;
            }
        };
        if !record.is_participant(user_id) {
            self.reply_error(
                user_id,
                conn_id,
                &CoreError::Unauthorized("not a match participant".into()),
            );
            return;
        }
        if body.is_empty() || body.chars().count() > shared::MAX_CHAT_LEN {
            self.reply_error(
                user_id,
                conn_id,
                &CoreError::Validation("invalid message body".into()),
            );
            return;
        }
        let msg = ChatServerMessage::MatchChat {
            match_id,
            from: user_id,
            body,
            ts: now_ms(),
        };
        for participant in [record.p1_id, record.p2_id] {
            if participant != user_id
                && self
                    .store
                    .chat
                    .is_blocked_either(user_id, participant)
                    .await
            {
                continue;
            }
            self.deliver(participant, &msg);
        }
    }

    /// Fan a message out to every live socket a room's online members hold.
    async fn broadcast_room(&self, room: &str, msg: &ChatServerMessage) {
        if let Some(members) = self.rooms.get(room) {
            for member in members {
                self.deliver(*member, msg);
            }
        }
    }

    fn deliver(&self, user_id: Uuid, msg: &ChatServerMessage) {
        if let Some(conns) = self.conns.get(&user_id) {
            if let Some(text) = crate::ws::frame(msg) {
                for conn in conns {
                    conn.send(text.clone());
                }
            }
        }
    }

    /// Reply on the exact socket the request came in on.
    fn reply(&self, user_id: Uuid, conn_id: u64, msg: &ChatServerMessage) {
        if let Some(conn) = self
            .conns
            .get(&user_id)
            .and_then(|conns| conns.iter().find(|c| c.id() == conn_id))
        {
            conn.send_msg(msg);
        }
    }

    fn reply_error(&self, user_id: Uuid, conn_id: u64, err: &CoreError) {
        self.reply(
            user_id,
            conn_id,
            &ChatServerMessage::Error {
                error: err.code(),
                message: err.to_string(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::super::spawn_chat;
    use super::*;
    use crate::config::Config;
    use crate::ws::conn_channel;
    use shared::ErrorCode;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_msg(rx: &mut mpsc::Receiver<String>) -> ChatServerMessage {
        let text = timeout(Duration::from_secs(30), rx.recv())
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

    struct TestPeer {
        user_id: Uuid,
        conn: ConnTx,
        rx: mpsc::Receiver<String>,
    }

    async fn join_peer(hub: &HubHandle, user_id: Uuid) -> TestPeer {
        let (conn, rx, _kill) = conn_channel();
        hub.send(HubCmd::Connect {
            user_id,
            conn: conn.clone(),
        })
        .await;
        let mut peer = TestPeer { user_id, conn, rx };
        wait_for(&mut peer.rx, |m| matches!(m, ChatServerMessage::Welcome { .. })).await;
        peer
    }

    async fn client(hub: &HubHandle, peer: &TestPeer, msg: ChatClientMessage) {
        hub.send(HubCmd::Client {
            user_id: peer.user_id,
            conn_id: peer.conn.id(),
            msg,
        })
        .await;
    }

    fn setup() -> (HubHandle, BrokerHandle, Arc<Store>) {
        let cfg = Arc::new(Config::for_tests());
        let store = Arc::new(Store::new());
        let (shutdown, _) = broadcast::channel(1);
        let (hub, broker) = spawn_chat(cfg, store.clone(), shutdown);
        (hub, broker, store)
    }

    #[tokio::test]
    async fn presence_counts_a_user_once() {
        let (hub, _broker, _store) = setup();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let mut a1 = join_peer(&hub, alice).await;
        client(&hub, &a1, ChatClientMessage::Join { room: "lobby".into() }).await;
        wait_for(&mut a1.rx, |m| matches!(m, ChatServerMessage::Joined { .. })).await;

        // second socket of the same user must not rebroadcast presence
        let mut a2 = join_peer(&hub, alice).await;
        client(&hub, &a2, ChatClientMessage::Join { room: "lobby".into() }).await;
        wait_for(&mut a2.rx, |m| matches!(m, ChatServerMessage::Joined { .. })).await;

        let mut b = join_peer(&hub, bob).await;
        client(&hub, &b, ChatClientMessage::Join { room: "lobby".into() }).await;
        wait_for(&mut b.rx, |m| matches!(m, ChatServerMessage::Joined { .. })).await;

        // alice sees bob come online exactly once; her own second socket
        // never rebroadcasts
        let msg = wait_for(&mut a1.rx, |m| {
            matches!(m, ChatServerMessage::Presence { user_id, .. } if *user_id == bob)
        })
        .await;
        match msg {
            ChatServerMessage::Presence { online, .. } => assert!(online),
            _ => unreachable!(),
        }

        // dropping one of alice's sockets keeps her online
        hub.send(HubCmd::Disconnect {
            user_id: alice,
            conn_id: a2.conn.id(),
        })
        .await;
        client(&hub, &b, ChatClientMessage::Channel {
            room: "lobby".into(),
            body: "hi".into(),
        })
        .await;
        let msg = wait_for(&mut a1.rx, |m| matches!(m, ChatServerMessage::Channel { .. })).await;
        match msg {
            ChatServerMessage::Channel { content, .. } => assert_eq!(content, "hi"),
            _ => unreachable!(),
        }

        // last socket leaving broadcasts offline to the room
        hub.send(HubCmd::Disconnect {
            user_id: alice,
            conn_id: a1.conn.id(),
        })
        .await;
        let msg = wait_for(&mut b.rx, |m| {
            matches!(m, ChatServerMessage::Presence { online: false, .. })
        })
        .await;
        match msg {
            ChatServerMessage::Presence { user_id, .. } => assert_eq!(user_id, alice),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn blocks_suppress_fanout_both_ways() {
        let (hub, _broker, store) = setup();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let carol = Uuid::new_v4();

        let mut a = join_peer(&hub, alice).await;
        let mut b = join_peer(&hub, bob).await;
        let mut c = join_peer(&hub, carol).await;
        for peer in [&a, &b, &c] {
            client(&hub, peer, ChatClientMessage::Join { room: "arena".into() }).await;
        }
        wait_for(&mut c.rx, |m| matches!(m, ChatServerMessage::Joined { .. })).await;

        store.chat.block(bob, alice, None).await.unwrap();

        client(&hub, &a, ChatClientMessage::Channel {
            room: "arena".into(),
            body: "anyone up for a match?".into(),
        })
        .await;

        // carol sees it, bob does not (blocked in either direction)
        let msg = wait_for(&mut c.rx, |m| matches!(m, ChatServerMessage::Channel { .. })).await;
        match msg {
            ChatServerMessage::Channel { from, .. } => assert_eq!(from, alice),
            _ => unreachable!(),
        }
        assert_nothing_leaked(&hub, &mut b).await;

        // dm from alice to bob is suppressed toward bob but echoed to alice
        client(&hub, &a, ChatClientMessage::Dm {
            to: bob,
            body: "psst".into(),
        })
        .await;
        let msg = wait_for(&mut a.rx, |m| matches!(m, ChatServerMessage::Dm { .. })).await;
        match msg {
            ChatServerMessage::Dm { from, .. } => assert_eq!(from, alice),
            _ => unreachable!(),
        }
        assert_nothing_leaked(&hub, &mut b).await;
    }

    /// Ping the hub on the peer's socket and assert no channel or dm frame
    /// was queued before the pong comes back.
    async fn assert_nothing_leaked(hub: &HubHandle, peer: &mut TestPeer) {
        hub.send(HubCmd::Client {
            user_id: peer.user_id,
            conn_id: peer.conn.id(),
            msg: ChatClientMessage::Ping { ts: None },
        })
        .await;
        loop {
            match next_msg(&mut peer.rx).await {
                ChatServerMessage::Pong { .. } => break,
                ChatServerMessage::Channel { .. } | ChatServerMessage::Dm { .. } => {
                    panic!("blocked message leaked through")
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn channel_message_requires_join() {
        let (hub, _broker, _store) = setup();
        let alice = Uuid::new_v4();
        let mut a = join_peer(&hub, alice).await;
        client(&hub, &a, ChatClientMessage::Channel {
            room: "nowhere".into(),
            body: "hello?".into(),
        })
        .await;
        let msg = next_msg(&mut a.rx).await;
        match msg {
            ChatServerMessage::Error { error, .. } => assert_eq!(error, ErrorCode::NotFound),
            other => panic!("expected error, got {other:?}"),
        }
    }
}
