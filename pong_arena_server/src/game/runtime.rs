//! Per-match single-writer runtime.
//!
//! One task owns one match: every stimulus (connect, disconnect, client
//! message, scheduler tick, grace or rematch expiry) is serialized through
//! the command channel and the `select!` loop, so no two handlers ever run
//! against the same state. Broadcasts go through non-blocking [`ConnTx`]
//! handles; a slow consumer is closed, never awaited.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, sleep, sleep_until, Instant, Interval, MissedTickBehavior};
use uuid::Uuid;

use engine::{Engine, EngineConfig, Side};
use shared::{
    close, BallView, CancelReason, ErrorCode, GameOverReason, GameStateView, MoveDir, PaddleView,
    PongClientMessage, PongServerMessage, ScoreView, CLEANUP_SECS, COUNTDOWN_SECS, REMATCH_TTL_SECS,
    TICK_HZ,
};

use super::RuntimeDeps;
use crate::error::CoreError;
use crate::stats;
use crate::store::{MatchRecord, MatchState};
use crate::util::now_ms;
use crate::ws::{frame, ConnTx};

const COMMAND_QUEUE_CAPACITY: usize = 256;

/// External stimuli accepted by a match runtime.
#[derive(Debug)]
pub enum MatchCmd {
    Connect { user_id: Uuid, conn: ConnTx },
    Disconnect { user_id: Uuid, conn_id: u64 },
    Message { user_id: Uuid, msg: PongClientMessage },
    GraceExpired { user_id: Uuid },
    RematchExpired { epoch: u64 },
}

#[derive(Clone)]
pub struct RuntimeHandle {
    pub match_id: Uuid,
    tx: mpsc::Sender<MatchCmd>,
}

impl RuntimeHandle {
    pub async fn send(&self, cmd: MatchCmd) {
        if self.tx.send(cmd).await.is_err() {
            tracing::debug!(match_id = %self.match_id, "runtime gone, command dropped");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Waiting,
    Countdown { seconds_left: u8 },
    Playing,
    Paused { by: Uuid },
    Ended,
}

struct Seat {
    user_id: Uuid,
    conn: Option<ConnTx>,
    ready: bool,
    last_seq: u64,
    window_anchor: Instant,
    window_count: u32,
}

impl Seat {
    fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            conn: None,
            ready: false,
            last_seq: 0,
            window_anchor: Instant::now(),
            window_count: 0,
        }
    }
}

struct RematchOffer {
    agreed: Vec<Uuid>,
    epoch: u64,
}

pub struct MatchRuntime {
    id: Uuid,
    tournament_id: Option<Uuid>,
    deps: RuntimeDeps,
    tx: mpsc::Sender<MatchCmd>,
    rx: mpsc::Receiver<MatchCmd>,
    seats: [Seat; 2],
    phase: Phase,
    engine: Engine,
    t0: Instant,
    rematch: Option<RematchOffer>,
    rematch_epoch: u64,
    destroy_at: Option<Instant>,
}

impl MatchRuntime {
    /// Spawn the runtime task for a match and return its handle.
    pub fn spawn(record: &MatchRecord, deps: RuntimeDeps) -> RuntimeHandle {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let engine_cfg = EngineConfig {
            winning_score: deps.cfg.winning_score,
            ..EngineConfig::default()
        };
        let runtime = MatchRuntime {
            id: record.id,
            tournament_id: record.tournament_id,
            tx: tx.clone(),
            rx,
            seats: [Seat::new(record.p1_id), Seat::new(record.p2_id)],
            phase: Phase::Waiting,
            engine: Engine::new(engine_cfg, None),
            t0: Instant::now(),
            rematch: None,
            rematch_epoch: 0,
            destroy_at: None,
            deps,
        };
        let handle = RuntimeHandle {
            match_id: record.id,
            tx,
        };
        tokio::spawn(runtime.run());
        handle
    }

    async fn run(mut self) {
        let mut shutdown = self.deps.shutdown.subscribe();
        let mut tick = interval(Duration::from_micros(1_000_000 / TICK_HZ));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut countdown = interval(Duration::from_secs(1));
        countdown.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let destroy_at = self
                .destroy_at
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd, &mut tick, &mut countdown).await,
                    None => break,
                },
                _ = tick.tick(), if self.phase == Phase::Playing => {
                    self.on_tick().await;
                }
                _ = countdown.tick(), if matches!(self.phase, Phase::Countdown { .. }) => {
                    self.on_countdown_tick(&mut tick).await;
                }
                _ = sleep_until(destroy_at), if self.destroy_at.is_some() => break,
                _ = shutdown.recv() => {
                    self.close_all(close::NORMAL);
                    break;
                }
            }
        }

        self.deps.registry.remove(self.id).await;
        tracing::info!(match_id = %self.id, "match runtime destroyed");
    }

    async fn handle(&mut self, cmd: MatchCmd, tick: &mut Interval, countdown: &mut Interval) {
        match cmd {
            MatchCmd::Connect { user_id, conn } => self.on_connect(user_id, conn).await,
            MatchCmd::Disconnect { user_id, conn_id } => {
                self.on_disconnect(user_id, conn_id).await
            }
            MatchCmd::GraceExpired { user_id } => {
                let absent = self
                    .seat(user_id)
                    .map(|s| s.conn.is_none())
                    .unwrap_or(false);
                if absent && self.phase != Phase::Ended {
                    self.forfeit(user_id).await;
                }
            }
            MatchCmd::RematchExpired { epoch } => {
                if self.rematch.as_ref().map(|o| o.epoch) == Some(epoch) {
                    self.rematch = None;
                    self.broadcast(&PongServerMessage::RematchCancelled {
                        reason: CancelReason::Timeout,
                    });
                }
            }
            MatchCmd::Message { user_id, msg } => {
                self.on_message(user_id, msg, countdown).await;
            }
        }
    }

    async fn on_message(
        &mut self,
        user_id: Uuid,
        msg: PongClientMessage,
        countdown: &mut Interval,
    ) {
        match msg {
            PongClientMessage::JoinMatch => {
                self.send_to(
                    user_id,
                    &PongServerMessage::Joined {
                        user_id,
                        game_state: self.snapshot_if_started(),
                    },
                );
            }
            PongClientMessage::RequestState => {
                self.send_to(user_id, &PongServerMessage::State(self.game_view()));
            }
            PongClientMessage::Ready => self.on_ready(user_id, countdown).await,
            PongClientMessage::Input { direction, seq, .. } => {
                self.on_input(user_id, direction, seq);
            }
            PongClientMessage::Pause => self.on_pause(user_id).await,
            PongClientMessage::Resume => self.on_resume(user_id, countdown).await,
            PongClientMessage::LeaveMatch | PongClientMessage::Forfeit => {
                self.on_leave(user_id).await;
            }
            PongClientMessage::RematchRequest => self.on_rematch_request(user_id).await,
            PongClientMessage::RematchAccept => self.on_rematch_accept(user_id).await,
            PongClientMessage::RematchDecline => self.on_rematch_decline(user_id),
            PongClientMessage::Ping { .. } => {
                self.send_to(
                    user_id,
                    &PongServerMessage::Pong {
                        timestamp: now_ms(),
                    },
                );
            }
        }
    }

    async fn on_connect(&mut self, user_id: Uuid, conn: ConnTx) {
        let snapshot = self.snapshot_if_started();
        let seat = match self.seat_mut(user_id) {
            Some(seat) => seat,
            None => {
                conn.close(close::UNAUTHORIZED);
                return;
            }
        };
        if let Some(old) = seat.conn.replace(conn.clone()) {
            old.close(close::NORMAL);
        }
        conn.send_msg(&PongServerMessage::Joined {
            user_id,
            game_state: snapshot,
        });
        tracing::info!(match_id = %self.id, user_id = %user_id, "participant connected");
        self.broadcast_ready_state();
    }

    async fn on_disconnect(&mut self, user_id: Uuid, conn_id: u64) {
        let current = self
            .seat(user_id)
            .and_then(|s| s.conn.as_ref().map(ConnTx::id));
        if current != Some(conn_id) {
            return; // stale: the seat was already replaced by a reconnect
        }
        if let Some(seat) = self.seat_mut(user_id) {
            seat.conn = None;
        }
        tracing::info!(match_id = %self.id, user_id = %user_id, "participant connection lost");

        match self.phase {
            Phase::Waiting => {
                if let Some(seat) = self.seat_mut(user_id) {
                    seat.ready = false;
                }
                self.broadcast(&PongServerMessage::Left { user_id });
                self.broadcast_ready_state();
                if self.seats.iter().all(|s| s.conn.is_none()) {
                    self.destroy_at = Some(Instant::now());
                }
            }
            Phase::Ended => {
                if self
                    .rematch
                    .as_ref()
                    .map(|o| o.agreed.contains(&user_id))
                    .unwrap_or(false)
                {
                    self.rematch = None;
                    self.broadcast(&PongServerMessage::RematchCancelled {
                        reason: CancelReason::Disconnect,
                    });
                }
            }
            _ => {
                self.broadcast(&PongServerMessage::Left { user_id });
                let grace = self.deps.cfg.reconnect_grace_secs;
                if grace > 0 {
                    let tx = self.tx.clone();
                    tokio::spawn(async move {
                        sleep(Duration::from_secs(grace)).await;
                        let _ = tx.send(MatchCmd::GraceExpired { user_id }).await;
                    });
                } else {
                    self.forfeit(user_id).await;
                }
            }
        }
    }

    async fn on_ready(&mut self, user_id: Uuid, countdown: &mut Interval) {
        if self.phase != Phase::Waiting {
            return;
        }
        match self.seat_mut(user_id) {
            Some(seat) => seat.ready = true,
            None => return,
        }
        self.broadcast_ready_state();
        let all_set = self.seats.iter().all(|s| s.conn.is_some() && s.ready);
        if all_set {
            if let Err(err) = self
                .deps
                .store
                .matches
                .set_state(self.id, MatchState::Countdown)
                .await
            {
                tracing::error!(match_id = %self.id, error = %err, "lifecycle write failed");
            }
            self.enter_countdown(countdown);
        }
    }

    fn enter_countdown(&mut self, countdown: &mut Interval) {
        self.phase = Phase::Countdown {
            seconds_left: COUNTDOWN_SECS,
        };
        countdown.reset();
        self.broadcast(&PongServerMessage::Countdown {
            seconds: COUNTDOWN_SECS,
        });
    }

    async fn on_countdown_tick(&mut self, tick: &mut Interval) {
        let seconds_left = match self.phase {
            Phase::Countdown { seconds_left } => seconds_left.saturating_sub(1),
            _ => return,
        };
        if seconds_left == 0 {
            self.phase = Phase::Playing;
            self.engine.sync(self.engine_now());
            tick.reset();
            if let Err(err) = self
                .deps
                .store
                .matches
                .set_state(self.id, MatchState::Playing)
                .await
            {
                tracing::error!(match_id = %self.id, error = %err, "lifecycle write failed");
            }
        } else {
            self.phase = Phase::Countdown { seconds_left };
            self.broadcast(&PongServerMessage::Countdown {
                seconds: seconds_left,
            });
        }
    }

    fn on_input(&mut self, user_id: Uuid, direction: MoveDir, seq: u64) {
        if self.phase != Phase::Playing {
            return;
        }
        let side = match self.side_of(user_id) {
            Some(side) => side,
            None => return,
        };
        let max_rate = self.deps.cfg.max_input_rate;
        let match_id = self.id;
        let seat = match self.seat_mut(user_id) {
            Some(seat) => seat,
            None => return,
        };
        if seq <= seat.last_seq {
            return;
        }
        let now = Instant::now();
        if now.duration_since(seat.window_anchor) >= Duration::from_secs(1) {
            seat.window_anchor = now;
            seat.window_count = 0;
        }
        if seat.window_count >= max_rate {
            tracing::debug!(match_id = %match_id, user_id = %user_id, "input rate limited");
            return;
        }
        seat.window_count += 1;
        seat.last_seq = seq;
        self.engine.set_direction(side, engine_dir(direction));
    }

    async fn on_pause(&mut self, user_id: Uuid) {
        if self.side_of(user_id).is_none() {
            return;
        }
        if self.phase != Phase::Playing {
            self.send_error(user_id, ErrorCode::InvalidState, "match is not playing");
            return;
        }
        self.phase = Phase::Paused { by: user_id };
        if let Err(err) = self
            .deps
            .store
            .matches
            .set_state(self.id, MatchState::Paused)
            .await
        {
            tracing::error!(match_id = %self.id, error = %err, "lifecycle write failed");
        }
        let _ = self
            .deps
            .store
            .matches
            .set_paused_by(self.id, Some(user_id))
            .await;
        self.broadcast(&PongServerMessage::Paused { by: user_id });
    }

    async fn on_resume(&mut self, user_id: Uuid, countdown: &mut Interval) {
        let paused_by = match self.phase {
            Phase::Paused { by } => by,
            _ => {
                self.send_error(user_id, ErrorCode::InvalidState, "match is not paused");
                return;
            }
        };
        if paused_by != user_id {
            self.send_error(
                user_id,
                ErrorCode::UnauthorizedResume,
                "only the pausing player may resume",
            );
            return;
        }
        let _ = self.deps.store.matches.set_paused_by(self.id, None).await;
        if let Err(err) = self
            .deps
            .store
            .matches
            .set_state(self.id, MatchState::Countdown)
            .await
        {
            tracing::error!(match_id = %self.id, error = %err, "lifecycle write failed");
        }
        self.broadcast(&PongServerMessage::Resume { by: user_id });
        self.enter_countdown(countdown);
    }

    async fn on_leave(&mut self, user_id: Uuid) {
        if self.side_of(user_id).is_none() {
            return;
        }
        match self.phase {
            Phase::Waiting => {
                if let Some(seat) = self.seat_mut(user_id) {
                    if let Some(conn) = seat.conn.take() {
                        conn.close(close::NORMAL);
                    }
                    seat.ready = false;
                }
                self.broadcast(&PongServerMessage::Left { user_id });
                self.broadcast_ready_state();
                if self.seats.iter().all(|s| s.conn.is_none()) {
                    self.destroy_at = Some(Instant::now());
                }
            }
            Phase::Ended => {
                if let Some(seat) = self.seat_mut(user_id) {
                    if let Some(conn) = seat.conn.take() {
                        conn.close(close::NORMAL);
                    }
                }
            }
            _ => self.forfeit(user_id).await,
        }
    }

    /// Terminal transition caused by a participant leaving mid-game. The
    /// remaining participant wins; if both are gone, the earlier-seated
    /// participant (p1) does.
    async fn forfeit(&mut self, leaver: Uuid) {
        if self.phase == Phase::Ended {
            return;
        }
        let p1 = self.seats[0].user_id;
        let other = if leaver == p1 {
            &self.seats[1]
        } else {
            &self.seats[0]
        };
        let winner = if other.conn.is_some() {
            other.user_id
        } else {
            p1
        };
        self.complete(MatchState::Forfeited, winner, GameOverReason::Forfeit)
            .await;
    }

    async fn on_tick(&mut self) {
        let continues = self.engine.tick(self.engine_now());
        self.broadcast(&PongServerMessage::State(self.game_view()));
        if !continues {
            let winner = match self.engine.winner_side() {
                Some(Side::P1) => self.seats[0].user_id,
                Some(Side::P2) => self.seats[1].user_id,
                None => return,
            };
            self.complete(MatchState::Ended, winner, GameOverReason::Score)
                .await;
        }
    }

    /// Persist the terminal row, refresh both participants' stats, notify
    /// the tournament when bound, then broadcast `game_over`.
    async fn complete(&mut self, state: MatchState, winner: Uuid, reason: GameOverReason) {
        let (p1_score, p2_score) = self.engine.score();
        match self
            .deps
            .store
            .matches
            .complete(self.id, state, winner, p1_score, p2_score)
            .await
        {
            Ok((record, changed)) => {
                if changed {
                    for user_id in [record.p1_id, record.p2_id] {
                        if let Err(err) =
                            stats::recompute_user(&self.deps.store, user_id).await
                        {
                            tracing::error!(user_id = %user_id, error = %err, "stats rebuild failed");
                        }
                    }
                    if let Some(tournament_id) = self.tournament_id {
                        self.deps
                            .tournaments
                            .match_completed(tournament_id, self.id, p1_score, p2_score, winner)
                            .await;
                    }
                }
            }
            Err(err) => {
                tracing::error!(match_id = %self.id, error = %err, "terminal write failed");
            }
        }
        self.broadcast(&PongServerMessage::GameOver {
            winner_id: winner,
            p1_score,
            p2_score,
            reason,
        });
        tracing::info!(
            match_id = %self.id,
            winner_id = %winner,
            ?reason,
            "match completed"
        );
        self.phase = Phase::Ended;
        self.destroy_at = Some(Instant::now() + Duration::from_secs(CLEANUP_SECS));
    }

    async fn on_rematch_request(&mut self, user_id: Uuid) {
        if self.phase != Phase::Ended || self.side_of(user_id).is_none() {
            self.send_error(user_id, ErrorCode::InvalidState, "match is not over");
            return;
        }
        let pending_from_other = match &self.rematch {
            None => None,
            Some(offer) => Some(!offer.agreed.contains(&user_id)),
        };
        match pending_from_other {
            None => {
                self.rematch_epoch += 1;
                let epoch = self.rematch_epoch;
                self.rematch = Some(RematchOffer {
                    agreed: vec![user_id],
                    epoch,
                });
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    sleep(Duration::from_secs(REMATCH_TTL_SECS)).await;
                    let _ = tx.send(MatchCmd::RematchExpired { epoch }).await;
                });
                self.send_to_opponent(
                    user_id,
                    &PongServerMessage::RematchRequested { from: user_id },
                );
            }
            // the second participant's own request implicitly accepts
            Some(true) => self.accept_rematch().await,
            Some(false) => {}
        }
    }

    async fn on_rematch_accept(&mut self, user_id: Uuid) {
        let pending_from_other = self
            .rematch
            .as_ref()
            .map(|o| !o.agreed.contains(&user_id))
            .unwrap_or(false);
        if self.phase != Phase::Ended || !pending_from_other {
            self.send_error(user_id, ErrorCode::InvalidState, "no rematch to accept");
            return;
        }
        self.accept_rematch().await;
    }

    fn on_rematch_decline(&mut self, user_id: Uuid) {
        if self.rematch.take().is_some() {
            self.send_to_opponent(user_id, &PongServerMessage::RematchDeclined);
        }
    }

    async fn accept_rematch(&mut self) {
        self.rematch = None;
        let (p1, p2) = (self.seats[0].user_id, self.seats[1].user_id);
        match self.deps.store.matches.create(p1, p2, None).await {
            Ok(record) => {
                self.broadcast(&PongServerMessage::RematchAccepted {
                    match_id: record.id,
                });
            }
            Err(err) => {
                tracing::error!(match_id = %self.id, error = %err, "rematch creation failed");
                self.broadcast(&PongServerMessage::Error {
                    code: ErrorCode::Internal,
                    message: "rematch creation failed".into(),
                });
            }
        }
    }

    // -- helpers ----------------------------------------------------------

    fn engine_now(&self) -> f64 {
        self.t0.elapsed().as_secs_f64()
    }

    fn side_of(&self, user_id: Uuid) -> Option<Side> {
        if self.seats[0].user_id == user_id {
            Some(Side::P1)
        } else if self.seats[1].user_id == user_id {
            Some(Side::P2)
        } else {
            None
        }
    }

    fn seat(&self, user_id: Uuid) -> Option<&Seat> {
        self.seats.iter().find(|s| s.user_id == user_id)
    }

    fn seat_mut(&mut self, user_id: Uuid) -> Option<&mut Seat> {
        self.seats.iter_mut().find(|s| s.user_id == user_id)
    }

    fn game_view(&self) -> GameStateView {
        let ball = self.engine.ball();
        let (p1, p2) = self.engine.score();
        GameStateView {
            timestamp: now_ms(),
            ball: BallView {
                x: ball.x,
                y: ball.y,
                vx: ball.vx,
                vy: ball.vy,
            },
            p1: PaddleView {
                y: self.engine.paddle_y(Side::P1),
            },
            p2: PaddleView {
                y: self.engine.paddle_y(Side::P2),
            },
            score: ScoreView { p1, p2 },
        }
    }

    fn snapshot_if_started(&self) -> Option<GameStateView> {
        match self.phase {
            Phase::Waiting => None,
            _ => Some(self.game_view()),
        }
    }

    fn broadcast(&self, msg: &PongServerMessage) {
        if let Some(text) = frame(msg) {
            for seat in &self.seats {
                if let Some(conn) = &seat.conn {
                    conn.send(text.clone());
                }
            }
        }
    }

    fn broadcast_ready_state(&self) {
        let connected = self
            .seats
            .iter()
            .filter(|s| s.conn.is_some())
            .map(|s| s.user_id)
            .collect();
        let ready = self
            .seats
            .iter()
            .filter(|s| s.ready)
            .map(|s| s.user_id)
            .collect();
        self.broadcast(&PongServerMessage::ReadyState { connected, ready });
    }

    fn send_to(&self, user_id: Uuid, msg: &PongServerMessage) {
        if let Some(conn) = self.seat(user_id).and_then(|s| s.conn.as_ref()) {
            conn.send_msg(msg);
        }
    }

    fn send_to_opponent(&self, user_id: Uuid, msg: &PongServerMessage) {
        if let Some(seat) = self.seats.iter().find(|s| s.user_id != user_id) {
            if let Some(conn) = &seat.conn {
                conn.send_msg(msg);
            }
        }
    }

    fn send_error(&self, user_id: Uuid, code: ErrorCode, message: &str) {
        self.send_to(
            user_id,
            &PongServerMessage::Error {
                code,
                message: message.to_string(),
            },
        );
    }

    fn close_all(&mut self, code: u16) {
        for seat in &mut self.seats {
            if let Some(conn) = seat.conn.take() {
                conn.close(code);
            }
        }
    }
}

fn engine_dir(dir: MoveDir) -> engine::Dir {
    match dir {
        MoveDir::Up => engine::Dir::Up,
        MoveDir::Down => engine::Dir::Down,
        MoveDir::Stop => engine::Dir::Stop,
    }
}

impl From<CoreError> for PongServerMessage {
    fn from(err: CoreError) -> Self {
        PongServerMessage::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::game::MatchRegistry;
    use crate::store::Store;
    use crate::tournament::TournamentService;
    use crate::ws::conn_channel;
    use std::sync::Arc;
    use tokio::sync::broadcast;
    use tokio::time::timeout;

    struct Fixture {
        deps: RuntimeDeps,
        record: MatchRecord,
        handle: RuntimeHandle,
    }

    async fn fixture(tweak: impl FnOnce(&mut Config)) -> Fixture {
        let mut cfg = Config::for_tests();
        tweak(&mut cfg);
        let cfg = Arc::new(cfg);
        let store = Arc::new(Store::new());
        let (shutdown, _) = broadcast::channel(1);
        let tournaments = Arc::new(TournamentService::new(store.clone(), shutdown.clone()));
        let registry = Arc::new(MatchRegistry::new());
        let deps = RuntimeDeps {
            cfg,
            store: store.clone(),
            registry: registry.clone(),
            tournaments,
            shutdown,
        };
        let record = store
            .matches
            .create(Uuid::new_v4(), Uuid::new_v4(), None)
            .await
            .unwrap();
        let handle = registry.get_or_create(&record, &deps).await;
        Fixture {
            deps,
            record,
            handle,
        }
    }

    async fn connect(
        handle: &RuntimeHandle,
        user_id: Uuid,
    ) -> (ConnTx, tokio::sync::mpsc::Receiver<String>) {
        let (conn, frames, _kill) = conn_channel();
        handle
            .send(MatchCmd::Connect {
                user_id,
                conn: conn.clone(),
            })
            .await;
        (conn, frames)
    }

    async fn next_msg(rx: &mut tokio::sync::mpsc::Receiver<String>) -> PongServerMessage {
        let text = timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("connection closed");
        serde_json::from_str(&text).expect("valid protocol frame")
    }

    async fn wait_for<F>(rx: &mut tokio::sync::mpsc::Receiver<String>, mut pred: F) -> PongServerMessage
    where
        F: FnMut(&PongServerMessage) -> bool,
    {
        loop {
            let msg = next_msg(rx).await;
            if pred(&msg) {
                return msg;
            }
        }
    }

    async fn start_playing(fx: &Fixture) -> (
        (ConnTx, tokio::sync::mpsc::Receiver<String>),
        (ConnTx, tokio::sync::mpsc::Receiver<String>),
    ) {
        let a = connect(&fx.handle, fx.record.p1_id).await;
        let b = connect(&fx.handle, fx.record.p2_id).await;
        let (mut a, mut b) = (a, b);
        for user_id in [fx.record.p1_id, fx.record.p2_id] {
            fx.handle
                .send(MatchCmd::Message {
                    user_id,
                    msg: PongClientMessage::Ready,
                })
                .await;
        }
        // countdown runs 3, 2, 1, then states begin
        for rx in [&mut a.1, &mut b.1] {
            for expected in [3u8, 2, 1] {
                let msg = wait_for(rx, |m| matches!(m, PongServerMessage::Countdown { .. })).await;
                match msg {
                    PongServerMessage::Countdown { seconds } => assert_eq!(seconds, expected),
                    _ => unreachable!(),
                }
            }
        }
        // wait until play has actually begun so follow-up commands land in
        // the playing phase
        for rx in [&mut a.1, &mut b.1] {
            wait_for(rx, |m| matches!(m, PongServerMessage::State(_))).await;
        }
        (a, b)
    }

    #[tokio::test(start_paused = true)]
    async fn ready_pair_counts_down_then_streams_state() {
        let fx = fixture(|_| {}).await;
        let ((_ca, mut ra), (_cb, _b)) = start_playing(&fx).await;

        let msg = wait_for(&mut ra, |m| matches!(m, PongServerMessage::State(_))).await;
        match msg {
            PongServerMessage::State(view) => {
                assert!((0.0..=1.0).contains(&view.ball.x));
                assert_eq!(view.score, ScoreView { p1: 0, p2: 0 });
            }
            _ => unreachable!(),
        }
        let row = fx.deps.store.matches.get(fx.record.id).await.unwrap();
        assert_eq!(row.state, MatchState::Playing);
        assert!(row.started_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_mid_play_forfeits_to_the_survivor() {
        let fx = fixture(|_| {}).await;
        let ((ca, _ra), (_cb, mut rb)) = start_playing(&fx).await;

        fx.handle
            .send(MatchCmd::Disconnect {
                user_id: fx.record.p1_id,
                conn_id: ca.id(),
            })
            .await;

        let msg = wait_for(&mut rb, |m| matches!(m, PongServerMessage::GameOver { .. })).await;
        match msg {
            PongServerMessage::GameOver {
                winner_id, reason, ..
            } => {
                assert_eq!(winner_id, fx.record.p2_id);
                assert_eq!(reason, GameOverReason::Forfeit);
            }
            _ => unreachable!(),
        }
        let row = fx.deps.store.matches.get(fx.record.id).await.unwrap();
        assert_eq!(row.state, MatchState::Forfeited);
        assert_eq!(row.winner_id, Some(fx.record.p2_id));
    }

    #[tokio::test(start_paused = true)]
    async fn resume_is_reserved_for_the_pauser() {
        let fx = fixture(|_| {}).await;
        let ((_ca, mut ra), (_cb, mut rb)) = start_playing(&fx).await;

        fx.handle
            .send(MatchCmd::Message {
                user_id: fx.record.p1_id,
                msg: PongClientMessage::Pause,
            })
            .await;
        wait_for(&mut rb, |m| matches!(m, PongServerMessage::Paused { .. })).await;

        fx.handle
            .send(MatchCmd::Message {
                user_id: fx.record.p2_id,
                msg: PongClientMessage::Resume,
            })
            .await;
        let msg = wait_for(&mut rb, |m| matches!(m, PongServerMessage::Error { .. })).await;
        match msg {
            PongServerMessage::Error { code, .. } => {
                assert_eq!(code, ErrorCode::UnauthorizedResume)
            }
            _ => unreachable!(),
        }
        assert_eq!(
            fx.deps.store.matches.get(fx.record.id).await.unwrap().state,
            MatchState::Paused
        );

        fx.handle
            .send(MatchCmd::Message {
                user_id: fx.record.p1_id,
                msg: PongClientMessage::Resume,
            })
            .await;
        wait_for(&mut ra, |m| matches!(m, PongServerMessage::Resume { .. })).await;
        let msg = wait_for(&mut ra, |m| matches!(m, PongServerMessage::Countdown { .. })).await;
        match msg {
            PongServerMessage::Countdown { seconds } => assert_eq!(seconds, 3),
            _ => unreachable!(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stale_inputs_are_dropped() {
        let fx = fixture(|_| {}).await;
        let ((_ca, mut ra), _b) = start_playing(&fx).await;

        let input = |seq, direction| MatchCmd::Message {
            user_id: fx.record.p1_id,
            msg: PongClientMessage::Input {
                direction,
                seq,
                client_time: None,
            },
        };
        fx.handle.send(input(5, MoveDir::Up)).await;

        async fn y_after(rx: &mut tokio::sync::mpsc::Receiver<String>) -> f64 {
            let msg = wait_for(rx, |m| matches!(m, PongServerMessage::State(_))).await;
            match msg {
                PongServerMessage::State(view) => view.p1.y,
                _ => unreachable!(),
            }
        }

        let start = y_after(&mut ra).await;
        let later = y_after(&mut ra).await;
        assert!(later < start, "paddle should move up");

        // stale seq must not override the commanded direction
        fx.handle.send(input(3, MoveDir::Down)).await;
        let a = y_after(&mut ra).await;
        let b = y_after(&mut ra).await;
        assert!(b <= a, "stale input must be ignored");

        fx.handle.send(input(6, MoveDir::Down)).await;
        let a = y_after(&mut ra).await;
        let mut b = y_after(&mut ra).await;
        // allow one in-flight frame before the new direction shows up
        if b <= a {
            b = y_after(&mut ra).await;
        }
        assert!(b > a, "fresh input must apply");
    }

    #[tokio::test(start_paused = true)]
    async fn input_flood_does_not_close_the_socket() {
        let fx = fixture(|_| {}).await;
        let ((ca, mut ra), _b) = start_playing(&fx).await;

        for seq in 1..=120u64 {
            fx.handle
                .send(MatchCmd::Message {
                    user_id: fx.record.p1_id,
                    msg: PongClientMessage::Input {
                        direction: MoveDir::Up,
                        seq,
                        client_time: None,
                    },
                })
                .await;
            // drain broadcasts so the fake client is not the slow consumer
            while let Ok(frame) = ra.try_recv() {
                drop(frame);
            }
        }
        // still streaming states, nobody was kicked
        wait_for(&mut ra, |m| matches!(m, PongServerMessage::State(_))).await;
        assert!(ca.send_msg(&PongServerMessage::Pong { timestamp: 0 }));
    }

    #[tokio::test(start_paused = true)]
    async fn both_vanishing_awards_the_earlier_seat() {
        let fx = fixture(|cfg| cfg.reconnect_grace_secs = 1).await;
        let ((ca, _ra), (cb, _rb)) = start_playing(&fx).await;

        fx.handle
            .send(MatchCmd::Disconnect {
                user_id: fx.record.p1_id,
                conn_id: ca.id(),
            })
            .await;
        fx.handle
            .send(MatchCmd::Disconnect {
                user_id: fx.record.p2_id,
                conn_id: cb.id(),
            })
            .await;

        // let both grace windows lapse
        tokio::time::sleep(Duration::from_secs(3)).await;

        let row = fx.deps.store.matches.get(fx.record.id).await.unwrap();
        assert_eq!(row.state, MatchState::Forfeited);
        assert_eq!(row.winner_id, Some(fx.record.p1_id));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_grace_resumes_play() {
        let fx = fixture(|cfg| {
            cfg.reconnect_grace_secs = 5;
            // the unattended game must not finish on points while we wait
            cfg.winning_score = 1000;
        })
        .await;
        let ((ca, _ra), (_cb, mut rb)) = start_playing(&fx).await;

        fx.handle
            .send(MatchCmd::Disconnect {
                user_id: fx.record.p1_id,
                conn_id: ca.id(),
            })
            .await;
        wait_for(&mut rb, |m| matches!(m, PongServerMessage::Left { .. })).await;

        let (_ca2, mut ra2) = connect(&fx.handle, fx.record.p1_id).await;
        let msg = wait_for(&mut ra2, |m| matches!(m, PongServerMessage::Joined { .. })).await;
        match msg {
            PongServerMessage::Joined { game_state, .. } => assert!(game_state.is_some()),
            _ => unreachable!(),
        }

        tokio::time::sleep(Duration::from_secs(10)).await;
        let row = fx.deps.store.matches.get(fx.record.id).await.unwrap();
        assert!(!row.state.is_terminal(), "reconnect must cancel the forfeit");
    }

    #[tokio::test(start_paused = true)]
    async fn rematch_pairs_both_requests_into_a_new_match() {
        let fx = fixture(|_| {}).await;
        let ((_ca, mut ra), (_cb, mut rb)) = start_playing(&fx).await;

        // end the match via explicit forfeit
        fx.handle
            .send(MatchCmd::Message {
                user_id: fx.record.p2_id,
                msg: PongClientMessage::Forfeit,
            })
            .await;
        wait_for(&mut ra, |m| matches!(m, PongServerMessage::GameOver { .. })).await;

        fx.handle
            .send(MatchCmd::Message {
                user_id: fx.record.p1_id,
                msg: PongClientMessage::RematchRequest,
            })
            .await;
        wait_for(&mut rb, |m| {
            matches!(m, PongServerMessage::RematchRequested { .. })
        })
        .await;

        // opponent's own request implicitly accepts
        fx.handle
            .send(MatchCmd::Message {
                user_id: fx.record.p2_id,
                msg: PongClientMessage::RematchRequest,
            })
            .await;
        let msg = wait_for(&mut ra, |m| {
            matches!(m, PongServerMessage::RematchAccepted { .. })
        })
        .await;
        let new_id = match msg {
            PongServerMessage::RematchAccepted { match_id } => match_id,
            _ => unreachable!(),
        };
        assert_ne!(new_id, fx.record.id);
        let row = fx.deps.store.matches.get(new_id).await.unwrap();
        assert_eq!(row.state, MatchState::Waiting);
        assert_eq!(
            (row.p1_id, row.p2_id),
            (fx.record.p1_id, fx.record.p2_id)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rematch_offer_times_out() {
        let fx = fixture(|_| {}).await;
        let ((_ca, mut ra), (_cb, _rb)) = start_playing(&fx).await;

        fx.handle
            .send(MatchCmd::Message {
                user_id: fx.record.p2_id,
                msg: PongClientMessage::Forfeit,
            })
            .await;
        wait_for(&mut ra, |m| matches!(m, PongServerMessage::GameOver { .. })).await;

        fx.handle
            .send(MatchCmd::Message {
                user_id: fx.record.p1_id,
                msg: PongClientMessage::RematchRequest,
            })
            .await;
        let msg = wait_for(&mut ra, |m| {
            matches!(m, PongServerMessage::RematchCancelled { .. })
        })
        .await;
        match msg {
            PongServerMessage::RematchCancelled { reason } => {
                assert_eq!(reason, CancelReason::Timeout)
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_prestart_runtime_destroys_itself() {
        let fx = fixture(|_| {}).await;
        let (ca, _ra) = connect(&fx.handle, fx.record.p1_id).await;
        assert_eq!(fx.deps.registry.len().await, 1);
        fx.handle
            .send(MatchCmd::Disconnect {
                user_id: fx.record.p1_id,
                conn_id: ca.id(),
            })
            .await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fx.deps.registry.len().await, 0);
    }
}
