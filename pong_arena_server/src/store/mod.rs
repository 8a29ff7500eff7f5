//! Narrow repository interfaces over the durable state.
//!
//! The physical store is in-memory: each repo owns its tables behind one
//! `RwLock`, so a multi-row update is a single critical section and a crash
//! cannot observe half of it. `DATABASE_URL` stays a config knob for a
//! relational backend.

pub mod chat;
pub mod matches;
pub mod sessions;
pub mod stats;
pub mod tournaments;

pub use chat::ChatRepo;
pub use matches::{MatchRecord, MatchRepo, MatchState};
pub use sessions::{SessionRecord, SessionStore};
pub use stats::{Outcome, RecentMatch, StatsRepo, UserStats};
pub use tournaments::{
    TournamentMatch, TournamentMatchStatus, TournamentPlayer, TournamentRecord, TournamentRepo,
    TournamentStatus,
};

/// All repositories, constructed once at startup and shared by handle.
pub struct Store {
    pub matches: MatchRepo,
    pub chat: ChatRepo,
    pub tournaments: TournamentRepo,
    pub stats: StatsRepo,
    pub sessions: SessionStore,
}

impl Store {
    pub fn new() -> Self {
        Self {
            matches: MatchRepo::new(),
            chat: ChatRepo::new(),
            tournaments: TournamentRepo::new(),
            stats: StatsRepo::new(),
            sessions: SessionStore::new(),
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}
