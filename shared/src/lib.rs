pub mod protocol;

pub use protocol::*;

/// Nominal physics tick rate for live matches.
pub const TICK_HZ: u64 = 60;
/// Countdown before play starts or resumes, one broadcast per second.
pub const COUNTDOWN_SECS: u8 = 3;
/// Match invites expire this long after creation.
pub const INVITE_TTL_SECS: u64 = 30;
/// Rematch offers expire this long after the first request.
pub const REMATCH_TTL_SECS: u64 = 15;
/// A finished match runtime lingers this long for rematch and late joins.
pub const CLEANUP_SECS: u64 = 30;
/// Keepalive ping interval on every socket.
pub const IDLE_PING_SECS: u64 = 30;
/// Chat message bodies are capped at this many characters.
pub const MAX_CHAT_LEN: usize = 2000;
