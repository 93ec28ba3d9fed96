pub mod apns;
pub mod bridge;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod http;
pub mod registry;

pub use config::Config;
pub use delivery::Gateway;
pub use http::{AppState, build_router};

use crate::apns::ApnsClient;
use crate::bridge::{Bridge, SubmitHandle};
use crate::registry::RegistryHandle;
use ng_bus::BusConnector;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Wire the registry, bridge, and façade over a bus connector. Returns
/// the HTTP state and the running bridge task.
pub fn wire(
    connector: Arc<dyn BusConnector>,
    publish_queue: usize,
    apns: Option<ApnsClient>,
) -> (AppState, JoinHandle<()>) {
    let registry = RegistryHandle::spawn();
    let submit = SubmitHandle::new();
    let bridge = tokio::spawn(
        Bridge::new(connector, registry.clone(), submit.clone(), publish_queue).run(),
    );
    let state = AppState {
        gateway: Gateway::new(registry, submit),
        apns,
    };
    (state, bridge)
}
