pub mod hub;
pub mod invites;

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::config::Config;
use crate::store::Store;

pub use hub::{HubCmd, HubHandle};
pub use invites::{BrokerCmd, BrokerHandle};

/// Spawn the chat hub and invitation broker. The two tasks hold handles to
/// each other, so both channels are created before either task starts.
pub fn spawn_chat(
    cfg: Arc<Config>,
    store: Arc<Store>,
    shutdown: broadcast::Sender<()>,
) -> (HubHandle, BrokerHandle) {
    let (hub_tx, hub_rx) = mpsc::channel(1024);
    let (broker_tx, broker_rx) = mpsc::channel(256);
    let hub = HubHandle::new(hub_tx);
    let broker = BrokerHandle::new(broker_tx);

    hub::ChatHub::spawn(hub_rx, broker.clone(), store.clone(), shutdown.clone());
    invites::InviteBroker::spawn(broker_rx, broker.clone(), hub.clone(), cfg, store, shutdown);

    (hub, broker)
}
