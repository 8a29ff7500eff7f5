use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// WebSocket close codes used across all endpoints.
pub mod close {
    pub const NORMAL: u16 = 1000;
    pub const BACKPRESSURE: u16 = 1009;
    pub const BAD_REQUEST: u16 = 4400;
    pub const UNAUTHORIZED: u16 = 4401;
    pub const NOT_FOUND: u16 = 4404;
    pub const RATE_LIMIT: u16 = 4429;
}

/// Machine-readable error codes carried by inline `error` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidInput,
    InvalidState,
    Unauthorized,
    UnauthorizedResume,
    NotFound,
    RateLimit,
    Internal,
}

/// Commanded paddle direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveDir {
    Up,
    Down,
    #[default]
    Stop,
}

/// Why a match ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameOverReason {
    Score,
    Forfeit,
}

/// Why an invite or rematch offer was withdrawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelReason {
    Timeout,
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BallView {
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PaddleView {
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreView {
    pub p1: u32,
    pub p2: u32,
}

/// One authoritative snapshot of a live match.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GameStateView {
    pub timestamp: u64,
    pub ball: BallView,
    pub p1: PaddleView,
    pub p2: PaddleView,
    pub score: ScoreView,
}

// ---------------------------------------------------------------------------
// /ws/pong/:matchId
// ---------------------------------------------------------------------------

/// Messages a match participant sends to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PongClientMessage {
    JoinMatch,
    LeaveMatch,
    Ready,
    #[serde(rename_all = "camelCase")]
    Input {
        direction: MoveDir,
        seq: u64,
        #[serde(default)]
        client_time: Option<u64>,
    },
    Pause,
    Resume,
    RequestState,
    RematchRequest,
    RematchAccept,
    RematchDecline,
    Forfeit,
    Ping {
        #[serde(default)]
        timestamp: Option<u64>,
    },
}

/// Messages the match runtime sends to participants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PongServerMessage {
    #[serde(rename_all = "camelCase")]
    ConnectionOk { user_id: Uuid, match_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Joined {
        user_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        game_state: Option<GameStateView>,
    },
    ReadyState {
        connected: Vec<Uuid>,
        ready: Vec<Uuid>,
    },
    Countdown { seconds: u8 },
    State(GameStateView),
    Paused { by: Uuid },
    Resume { by: Uuid },
    #[serde(rename_all = "camelCase")]
    GameOver {
        winner_id: Uuid,
        p1_score: u32,
        p2_score: u32,
        reason: GameOverReason,
    },
    Error { code: ErrorCode, message: String },
    Pong { timestamp: u64 },
    #[serde(rename_all = "camelCase")]
    Left { user_id: Uuid },
    RematchRequested { from: Uuid },
    #[serde(rename_all = "camelCase")]
    RematchAccepted { match_id: Uuid },
    RematchDeclined,
    RematchCancelled { reason: CancelReason },
}

// ---------------------------------------------------------------------------
// /ws/chat
// ---------------------------------------------------------------------------

/// Messages a chat client sends to the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatClientMessage {
    Join { room: String },
    Channel { room: String, body: String },
    Dm { to: Uuid, body: String },
    #[serde(rename = "match", rename_all = "camelCase")]
    MatchChat { match_id: Uuid, body: String },
    MatchInvite { to: Uuid },
    #[serde(rename_all = "camelCase")]
    MatchInviteResponse { invite_id: Uuid, accepted: bool },
    #[serde(rename_all = "camelCase")]
    Block {
        user_id: Uuid,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Unblock { user_id: Uuid },
    Ping {
        #[serde(default)]
        ts: Option<u64>,
    },
}

/// Messages the hub sends to chat clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatServerMessage {
    #[serde(rename_all = "camelCase")]
    Welcome { user_id: Uuid },
    Joined { room: String },
    #[serde(rename_all = "camelCase")]
    Presence {
        room: String,
        user_id: Uuid,
        online: bool,
    },
    Channel {
        from: Uuid,
        room: String,
        content: String,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    Dm {
        from: Uuid,
        user_id: Uuid,
        content: String,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    MatchChat {
        match_id: Uuid,
        from: Uuid,
        body: String,
        ts: u64,
    },
    #[serde(rename_all = "camelCase")]
    MatchInvite {
        invite_id: Uuid,
        from: Uuid,
        expires_at: u64,
    },
    #[serde(rename_all = "camelCase")]
    MatchInviteSent {
        invite_id: Uuid,
        to: Uuid,
        expires_at: u64,
    },
    #[serde(rename_all = "camelCase")]
    MatchInviteAccepted { invite_id: Uuid, match_id: Uuid },
    #[serde(rename_all = "camelCase")]
    MatchInviteConfirmed { invite_id: Uuid, match_id: Uuid },
    #[serde(rename_all = "camelCase")]
    MatchInviteDeclined { invite_id: Uuid },
    #[serde(rename_all = "camelCase")]
    MatchInviteCancelled { invite_id: Uuid },
    #[serde(rename_all = "camelCase")]
    MatchInviteExpired {
        invite_id: Uuid,
        reason: CancelReason,
    },
    MatchInviteError { error: String },
    #[serde(rename_all = "camelCase")]
    Blocked { user_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Unblocked { user_id: Uuid },
    Error { error: ErrorCode, message: String },
    Pong { ts: u64 },
}

// ---------------------------------------------------------------------------
// /ws/tournament
// ---------------------------------------------------------------------------

/// Messages a tournament spectator sends to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TournamentClientMessage {
    #[serde(rename_all = "camelCase")]
    Subscribe { tournament_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Unsubscribe { tournament_id: Uuid },
    Ping {
        #[serde(default)]
        ts: Option<u64>,
    },
}

/// The currently announced pairing of a tournament.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnouncedMatch {
    pub match_id: Uuid,
    pub p1: String,
    pub p2: String,
    pub order: u32,
}

/// A recorded tournament match result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TournamentResultView {
    pub match_id: Uuid,
    pub winner_id: Uuid,
    pub p1_score: u32,
    pub p2_score: u32,
}

/// Messages the tournament coordinator sends to subscribers.
///
/// Event names are camelCase on the wire (`announceNext`, `result`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TournamentServerMessage {
    #[serde(rename_all = "camelCase")]
    Subscribed { tournament_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Unsubscribed { tournament_id: Uuid },
    #[serde(rename_all = "camelCase")]
    AnnounceNext {
        tournament_id: Uuid,
        payload: AnnouncedMatch,
    },
    #[serde(rename_all = "camelCase")]
    Result {
        tournament_id: Uuid,
        payload: TournamentResultView,
    },
    Error { error: ErrorCode, message: String },
    Pong { ts: u64 },
}
