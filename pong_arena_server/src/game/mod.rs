pub mod registry;
pub mod runtime;

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::Config;
use crate::store::Store;
use crate::tournament::TournamentService;

pub use registry::MatchRegistry;
pub use runtime::{MatchCmd, RuntimeHandle};

/// Everything a match runtime needs from the rest of the process.
#[derive(Clone)]
pub struct RuntimeDeps {
    pub cfg: Arc<Config>,
    pub store: Arc<Store>,
    pub registry: Arc<MatchRegistry>,
    pub tournaments: Arc<TournamentService>,
    pub shutdown: broadcast::Sender<()>,
}
