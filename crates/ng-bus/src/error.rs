use thiserror::Error;

/// Errors surfaced by a bus implementation.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connect failed: {0}")]
    Connect(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("unsubscribe failed: {0}")]
    Unsubscribe(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("bus receive failed: {0}")]
    Receive(String),
    #[error("bus not connected")]
    NotConnected,
}
