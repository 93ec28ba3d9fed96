//! Distributed pub/sub bus boundary for the notification gateway.
//!
//! The gateway core talks to the bus exclusively through the traits in
//! this crate: one subscriber handle (channel membership), one
//! publisher handle, and one event stream per bus connection. A
//! [`BusConnector`] hands out all three as a unit so the bridge can
//! tear down and recreate them together when the bus fails.
//!
//! Production uses [`RedisBus`]; tests and local development use
//! [`MemoryBus`].

mod error;
mod memory;
mod redis_bus;

pub use error::BusError;
pub use memory::{BusOp, MemoryBus};
pub use redis_bus::RedisBus;

use async_trait::async_trait;
use std::sync::Arc;

/// One event drawn from the bus receive stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// Subscription confirmation; informational only.
    Subscription { channel: String, count: usize },
    /// A payload published to a channel this connection is subscribed to.
    Message { channel: String, payload: String },
    /// Liveness reply from the bus itself; informational only.
    Pong,
    /// Anything the bus sent that we do not recognize.
    Unknown,
}

/// Channel membership for one bus connection.
///
/// Shared with the connection registry, which subscribes a client id
/// when its first connection is admitted and unsubscribes when its
/// last connection is removed.
#[async_trait]
pub trait BusSubscriber: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<(), BusError>;
    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError>;
}

/// Outbound side of one bus connection.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError>;
}

/// Inbound side of one bus connection; one call per receive-loop
/// iteration. An `Err` means the connection is unusable and the whole
/// bus epoch must be rebuilt.
#[async_trait]
pub trait BusEvents: Send {
    async fn next_event(&mut self) -> Result<BusEvent, BusError>;
}

/// The three handles making up one bus connection epoch.
pub struct BusParts {
    pub subscriber: Arc<dyn BusSubscriber>,
    pub publisher: Arc<dyn BusPublisher>,
    pub events: Box<dyn BusEvents>,
}

/// Factory for bus connections; called once per bridge epoch.
#[async_trait]
pub trait BusConnector: Send + Sync {
    async fn connect(&self) -> Result<BusParts, BusError>;
}
