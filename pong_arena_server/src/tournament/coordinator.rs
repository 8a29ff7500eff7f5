//! Per-tournament coordinator: queue pairing, the announce-next state
//! machine, result recording and event fan-out. One task per tournament;
//! every subscriber observes `announceNext`/`result` in the same order.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use shared::{AnnouncedMatch, TournamentResultView, TournamentServerMessage};

use crate::error::CoreError;
use crate::store::{
    Store, TournamentMatch, TournamentMatchStatus, TournamentPlayer, TournamentStatus,
};
use crate::util::now_ms;
use crate::ws::ConnTx;

#[derive(Debug)]
pub enum TournamentCmd {
    Register {
        alias: String,
        user_id: Option<Uuid>,
        reply: oneshot::Sender<Result<TournamentPlayer, CoreError>>,
    },
    QueueJoin {
        player_id: Uuid,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    QueueLeave {
        player_id: Uuid,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    AnnounceNext {
        reply: oneshot::Sender<Result<Option<TournamentMatch>, CoreError>>,
    },
    RecordResult {
        match_id: Uuid,
        p1_score: u32,
        p2_score: u32,
        winner_id: Uuid,
        reply: oneshot::Sender<Result<TournamentMatch, CoreError>>,
    },
    MatchCompleted {
        match_id: Uuid,
        p1_score: u32,
        p2_score: u32,
        winner_user: Uuid,
    },
    Subscribe {
        conn: ConnTx,
    },
    Unsubscribe {
        conn_id: u64,
    },
}

#[derive(Clone)]
pub struct CoordinatorHandle {
    pub tournament_id: Uuid,
    tx: mpsc::Sender<TournamentCmd>,
}

impl CoordinatorHandle {
    pub async fn send(&self, cmd: TournamentCmd) {
        if self.tx.send(cmd).await.is_err() {
            tracing::debug!(tournament_id = %self.tournament_id, "coordinator gone");
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, CoreError>>) -> TournamentCmd,
    ) -> Result<T, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await;
        rx.await
            .unwrap_or_else(|_| Err(CoreError::Internal("coordinator stopped".into())))
    }

    pub async fn register(
        &self,
        alias: String,
        user_id: Option<Uuid>,
    ) -> Result<TournamentPlayer, CoreError> {
        self.request(|reply| TournamentCmd::Register {
            alias,
            user_id,
            reply,
        })
        .await
    }

    pub async fn queue_join(&self, player_id: Uuid) -> Result<(), CoreError> {
        self.request(|reply| TournamentCmd::QueueJoin { player_id, reply })
            .await
    }

    pub async fn queue_leave(&self, player_id: Uuid) -> Result<(), CoreError> {
        self.request(|reply| TournamentCmd::QueueLeave { player_id, reply })
            .await
    }

    pub async fn announce_next(&self) -> Result<Option<TournamentMatch>, CoreError> {
        self.request(|reply| TournamentCmd::AnnounceNext { reply })
            .await
    }

    pub async fn record_result(
        &self,
        match_id: Uuid,
        p1_score: u32,
        p2_score: u32,
        winner_id: Uuid,
    ) -> Result<TournamentMatch, CoreError> {
        self.request(|reply| TournamentCmd::RecordResult {
            match_id,
            p1_score,
            p2_score,
            winner_id,
            reply,
        })
        .await
    }

    pub async fn subscribe(&self, conn: ConnTx) {
        self.send(TournamentCmd::Subscribe { conn }).await;
    }

    pub async fn unsubscribe(&self, conn_id: u64) {
        self.send(TournamentCmd::Unsubscribe { conn_id }).await;
    }
}

enum AnnounceOutcome {
    NoPair,
    AlreadyAnnounced(TournamentMatch),
    New(TournamentMatch),
}

pub struct Coordinator {
    id: Uuid,
    store: Arc<Store>,
    subscribers: Vec<ConnTx>,
}

impl Coordinator {
    pub fn spawn(
        id: Uuid,
        store: Arc<Store>,
        shutdown: broadcast::Sender<()>,
    ) -> CoordinatorHandle {
        let (tx, rx) = mpsc::channel(256);
        let coordinator = Coordinator {
            id,
            store,
            subscribers: Vec::new(),
        };
        tokio::spawn(coordinator.run(rx, shutdown.subscribe()));
        CoordinatorHandle {
            tournament_id: id,
            tx,
        }
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<TournamentCmd>,
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
        tracing::info!(tournament_id = %self.id, "tournament coordinator stopped");
    }

    async fn handle(&mut self, cmd: TournamentCmd) {
        match cmd {
            TournamentCmd::Register {
                alias,
                user_id,
                reply,
            } => {
                let _ = reply.send(self.register(alias, user_id).await);
            }
            TournamentCmd::QueueJoin { player_id, reply } => {
                let _ = reply.send(self.set_queued(player_id, Some(now_ms())).await);
            }
            TournamentCmd::QueueLeave { player_id, reply } => {
                let _ = reply.send(self.set_queued(player_id, None).await);
            }
            TournamentCmd::AnnounceNext { reply } => {
                let _ = reply.send(self.announce_next().await);
            }
            TournamentCmd::RecordResult {
                match_id,
                p1_score,
                p2_score,
                winner_id,
                reply,
            } => {
                let _ = reply.send(
                    self.record_result(match_id, p1_score, p2_score, winner_id)
                        .await,
                );
            }
            TournamentCmd::MatchCompleted {
                match_id,
                p1_score,
                p2_score,
                winner_user,
            } => {
                self.match_completed(match_id, p1_score, p2_score, winner_user)
                    .await;
            }
            TournamentCmd::Subscribe { conn } => self.subscribe(conn).await,
            TournamentCmd::Unsubscribe { conn_id } => {
                if let Some(pos) = self.subscribers.iter().position(|c| c.id() == conn_id) {
                    let conn = self.subscribers.remove(pos);
                    conn.send_msg(&TournamentServerMessage::Unsubscribed {
                        tournament_id: self.id,
                    });
                }
            }
        }
    }

    async fn register(
        &self,
        alias: String,
        user_id: Option<Uuid>,
    ) -> Result<TournamentPlayer, CoreError> {
        if alias.is_empty() || alias.len() > 32 {
            return Err(CoreError::Validation("invalid alias".into()));
        }
        let id = self.id;
        self.store
            .tournaments
            .mutate(id, move |t| {
                if t.status == TournamentStatus::Completed {
                    return Err(CoreError::InvalidState("tournament is completed".into()));
                }
                if t.players.iter().any(|p| p.alias == alias) {
                    return Err(CoreError::InvalidState("alias already registered".into()));
                }
                let player = TournamentPlayer {
                    id: Uuid::new_v4(),
                    tournament_id: id,
                    alias,
                    user_id,
                    queued_at: None,
                    created_at: now_ms(),
                };
                t.players.push(player.clone());
                Ok(player)
            })
            .await
    }

    async fn set_queued(&self, player_id: Uuid, queued_at: Option<u64>) -> Result<(), CoreError> {
        self.store
            .tournaments
            .mutate(self.id, move |t| {
                if t.status == TournamentStatus::Completed {
                    return Err(CoreError::InvalidState("tournament is completed".into()));
                }
                let player = t
                    .players
                    .iter_mut()
                    .find(|p| p.id == player_id)
                    .ok_or_else(|| CoreError::NotFound(format!("player {player_id}")))?;
                player.queued_at = queued_at;
                Ok(())
            })
            .await
    }

    /// Promote the two earliest-queued players into the announced slot.
    /// Idempotent: an already-announced match is returned as-is, and fewer
    /// than two queued players yields `None`.
    async fn announce_next(&mut self) -> Result<Option<TournamentMatch>, CoreError> {
        let id = self.id;
        let outcome = self
            .store
            .tournaments
            .mutate(id, move |t| {
                if let Some(current) = t
                    .matches
                    .iter()
                    .find(|m| m.status == TournamentMatchStatus::Announced)
                {
                    return Ok(AnnounceOutcome::AlreadyAnnounced(current.clone()));
                }
                let mut queued: Vec<(u64, u64, Uuid)> = t
                    .players
                    .iter()
                    .filter_map(|p| p.queued_at.map(|q| (q, p.created_at, p.id)))
                    .collect();
                if queued.len() < 2 {
                    return Ok(AnnounceOutcome::NoPair);
                }
                queued.sort();
                let (p1_id, p2_id) = (queued[0].2, queued[1].2);
                let order = t.matches.iter().map(|m| m.order).max().unwrap_or(0) + 1;
                let record = TournamentMatch {
                    id: Uuid::new_v4(),
                    tournament_id: id,
                    p1_id,
                    p2_id,
                    order,
                    status: TournamentMatchStatus::Announced,
                    winner_id: None,
                    p1_score: None,
                    p2_score: None,
                    match_id: None,
                    created_at: now_ms(),
                    announced_at: Some(now_ms()),
                    completed_at: None,
                };
                for player in t.players.iter_mut() {
                    if player.id == p1_id || player.id == p2_id {
                        player.queued_at = None;
                    }
                }
                t.matches.push(record.clone());
                if t.status == TournamentStatus::Pending {
                    t.status = TournamentStatus::Running;
                    t.started_at = Some(now_ms());
                }
                Ok(AnnounceOutcome::New(record))
            })
            .await?;

        match outcome {
            AnnounceOutcome::NoPair => Ok(None),
            AnnounceOutcome::AlreadyAnnounced(record) => Ok(Some(record)),
            AnnounceOutcome::New(mut record) => {
                record = self.attach_live_match(record).await;
                tracing::info!(
                    tournament_id = %id,
                    order = record.order,
                    "tournament match announced"
                );
                if let Some(payload) = self.announced_payload(&record).await {
                    self.broadcast(&TournamentServerMessage::AnnounceNext {
                        tournament_id: id,
                        payload,
                    });
                }
                Ok(Some(record))
            }
        }
    }

    /// Back a pairing of two registered accounts with a live pong match so
    /// the runtime can report its result.
    async fn attach_live_match(&self, record: TournamentMatch) -> TournamentMatch {
        let users = self
            .store
            .tournaments
            .get(self.id)
            .await
            .map(|t| {
                let find = |pid: Uuid| {
                    t.players
                        .iter()
                        .find(|p| p.id == pid)
                        .and_then(|p| p.user_id)
                };
                (find(record.p1_id), find(record.p2_id))
            })
            .unwrap_or((None, None));
        let (Some(u1), Some(u2)) = users else {
            return record;
        };
        let live = match self.store.matches.create(u1, u2, Some(self.id)).await {
            Ok(live) => live,
            Err(err) => {
                tracing::error!(tournament_id = %self.id, error = %err, "live match creation failed");
                return record;
            }
        };
        let tm_id = record.id;
        let live_id = live.id;
        let updated = self
            .store
            .tournaments
            .mutate(self.id, move |t| {
                let tm = t
                    .matches
                    .iter_mut()
                    .find(|m| m.id == tm_id)
                    .ok_or_else(|| CoreError::NotFound(format!("tournament match {tm_id}")))?;
                tm.match_id = Some(live_id);
                Ok(tm.clone())
            })
            .await;
        match updated {
            Ok(updated) => updated,
            Err(_) => record,
        }
    }

    async fn record_result(
        &mut self,
        match_id: Uuid,
        p1_score: u32,
        p2_score: u32,
        winner_id: Uuid,
    ) -> Result<TournamentMatch, CoreError> {
        let id = self.id;
        let (record, fresh) = self
            .store
            .tournaments
            .mutate(id, move |t| {
                let tm = t
                    .matches
                    .iter_mut()
                    .find(|m| m.id == match_id)
                    .ok_or_else(|| CoreError::NotFound(format!("tournament match {match_id}")))?;
                match tm.status {
                    TournamentMatchStatus::Completed => return Ok((tm.clone(), false)),
                    TournamentMatchStatus::Pending => {
                        return Err(CoreError::InvalidState("match not announced".into()));
                    }
                    TournamentMatchStatus::Announced => {}
                }
                if winner_id != tm.p1_id && winner_id != tm.p2_id {
                    return Err(CoreError::Validation(
                        "winner must be one of the paired players".into(),
                    ));
                }
                tm.status = TournamentMatchStatus::Completed;
                tm.winner_id = Some(winner_id);
                tm.p1_score = Some(p1_score);
                tm.p2_score = Some(p2_score);
                tm.completed_at = Some(now_ms());
                let done = tm.clone();

                let open_matches = t
                    .matches
                    .iter()
                    .any(|m| m.status != TournamentMatchStatus::Completed);
                let queued = t.players.iter().any(|p| p.queued_at.is_some());
                if !open_matches && !queued {
                    t.status = TournamentStatus::Completed;
                    t.completed_at = Some(now_ms());
                }
                Ok((done, true))
            })
            .await?;

        if fresh {
            tracing::info!(tournament_id = %id, order = record.order, "tournament result recorded");
            self.broadcast(&TournamentServerMessage::Result {
                tournament_id: id,
                payload: TournamentResultView {
                    match_id: record.id,
                    winner_id,
                    p1_score,
                    p2_score,
                },
            });
        }
        Ok(record)
    }

    async fn match_completed(
        &mut self,
        match_id: Uuid,
        p1_score: u32,
        p2_score: u32,
        winner_user: Uuid,
    ) {
        let pairing = self.store.tournaments.get(self.id).await.and_then(|t| {
            t.matches
                .iter()
                .find(|m| m.match_id == Some(match_id))
                .map(|m| (m.id, m.p1_id, m.p2_id, t.players.clone()))
        });
        let Some((tm_id, p1_id, p2_id, players)) = pairing else {
            return;
        };
        let winner_player = players
            .iter()
            .find(|p| p.user_id == Some(winner_user))
            .map(|p| p.id)
            .filter(|pid| *pid == p1_id || *pid == p2_id);
        let Some(winner_id) = winner_player else {
            tracing::warn!(tournament_id = %self.id, match_id = %match_id, "winner is not a paired player");
            return;
        };
        if let Err(err) = self
            .record_result(tm_id, p1_score, p2_score, winner_id)
            .await
        {
            tracing::warn!(tournament_id = %self.id, error = %err, "live result not recorded");
        }
    }

    async fn subscribe(&mut self, conn: ConnTx) {
        conn.send_msg(&TournamentServerMessage::Subscribed {
            tournament_id: self.id,
        });
        // replay the current announced match so late subscribers catch up
        if let Some(t) = self.store.tournaments.get(self.id).await {
            if let Some(current) = t
                .matches
                .iter()
                .find(|m| m.status == TournamentMatchStatus::Announced)
            {
                if let Some(payload) = self.announced_payload(current).await {
                    conn.send_msg(&TournamentServerMessage::AnnounceNext {
                        tournament_id: self.id,
                        payload,
                    });
                }
            }
        }
        self.subscribers.push(conn);
    }

    async fn announced_payload(&self, record: &TournamentMatch) -> Option<AnnouncedMatch> {
        let t = self.store.tournaments.get(self.id).await?;
        let alias = |pid: Uuid| {
            t.players
                .iter()
                .find(|p| p.id == pid)
                .map(|p| p.alias.clone())
        };
        Some(AnnouncedMatch {
            match_id: record.id,
            p1: alias(record.p1_id)?,
            p2: alias(record.p2_id)?,
            order: record.order,
        })
    }

    fn broadcast(&mut self, msg: &TournamentServerMessage) {
        if let Some(text) = crate::ws::frame(msg) {
            self.subscribers.retain(|conn| conn.send(text.clone()));
        }
    }
}
