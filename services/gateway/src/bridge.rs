//! Bridge between the bus and the local connection registry.
//!
//! The bridge owns the bus connection lifecycle. Each successful
//! connect starts an epoch: the fresh subscriber is swapped into the
//! registry, a bounded publish queue is installed into the shared
//! `SubmitHandle`, and a publish task drains that queue onto the bus.
//! The bridge then sits on the event stream, fanning incoming messages
//! out to local connections. Any receive error ends the epoch: the
//! publish task is torn down, the submit handle is disarmed, and the
//! bridge reconnects with bounded backoff. Messages in flight during
//! teardown are lost; clients connected across the gap keep their
//! sockets but stop receiving bus traffic until they reconnect.

use crate::registry::RegistryHandle;
use ng_bus::{BusConnector, BusEvent, BusPublisher};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("bus is not connected")]
    NotConnected,
}

struct Publish {
    channel: String,
    payload: String,
}

/// Clonable entry point for publishing notifications. Armed with a
/// bounded queue while a bus epoch is live, disarmed in between.
#[derive(Clone, Default)]
pub struct SubmitHandle {
    tx: Arc<RwLock<Option<mpsc::Sender<Publish>>>>,
}

impl SubmitHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a payload for publication on `channel`. Waits when the
    /// publish queue is full; fails when no bus epoch is live.
    pub async fn submit(&self, channel: &str, payload: &str) -> Result<(), SubmitError> {
        // Clone the sender out so teardown is never blocked behind a
        // submitter waiting on a full queue.
        let tx = self
            .tx
            .read()
            .await
            .clone()
            .ok_or(SubmitError::NotConnected)?;
        tx.send(Publish {
            channel: channel.to_owned(),
            payload: payload.to_owned(),
        })
        .await
        .map_err(|_| SubmitError::NotConnected)
    }

    async fn arm(&self, tx: mpsc::Sender<Publish>) {
        *self.tx.write().await = Some(tx);
    }

    async fn disarm(&self) {
        *self.tx.write().await = None;
    }
}

pub struct Bridge {
    connector: Arc<dyn BusConnector>,
    registry: RegistryHandle,
    submit: SubmitHandle,
    queue_capacity: usize,
}

impl Bridge {
    pub fn new(
        connector: Arc<dyn BusConnector>,
        registry: RegistryHandle,
        submit: SubmitHandle,
        queue_capacity: usize,
    ) -> Self {
        Self {
            connector,
            registry,
            submit,
            queue_capacity,
        }
    }

    /// Run forever, reconnecting after every failure.
    pub async fn run(self) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.connector.connect().await {
                Ok(parts) => {
                    info!("bus connected");
                    backoff = INITIAL_BACKOFF;
                    self.run_epoch(parts).await;
                }
                Err(e) => {
                    warn!(error = %e, "bus connect failed");
                }
            }
            debug!(delay = ?backoff, "bus reconnect backoff");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Drive one bus epoch until the event stream fails.
    async fn run_epoch(&self, parts: ng_bus::BusParts) {
        let ng_bus::BusParts {
            subscriber,
            publisher,
            mut events,
        } = parts;

        self.registry.swap_subscriber(subscriber).await;

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.submit.arm(tx).await;
        let epoch_cancel = CancellationToken::new();
        let publish_task = tokio::spawn(publish_loop(publisher, rx, epoch_cancel.clone()));

        loop {
            match events.next_event().await {
                Ok(BusEvent::Message { channel, payload }) => {
                    fan_out(self.registry.clone(), channel, payload);
                }
                Ok(event) => {
                    debug!(?event, "bus control event");
                }
                Err(e) => {
                    warn!(error = %e, "bus receive failed, tearing down epoch");
                    break;
                }
            }
        }

        // Disarm first so no new publish is queued, then stop the
        // drain task and cancel whatever is still publishing.
        self.submit.disarm().await;
        publish_task.abort();
        epoch_cancel.cancel();
        let _ = publish_task.await;
    }
}

/// Drains the publish queue. Each item is published in its own task so
/// one slow publish never holds up the next dequeue; the token cancels
/// anything still in flight when the epoch ends.
async fn publish_loop(
    publisher: Arc<dyn BusPublisher>,
    mut rx: mpsc::Receiver<Publish>,
    cancel: CancellationToken,
) {
    while let Some(publish) = rx.recv().await {
        let publisher = publisher.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                result = publisher.publish(&publish.channel, &publish.payload) => {
                    // The event stream will notice a dead connection;
                    // a lone publish failure only costs this message.
                    if let Err(e) = result {
                        warn!(channel = %publish.channel, error = %e, "bus publish failed");
                    }
                }
            }
        });
    }
}

/// Deliver one bus message to every active local connection for the
/// channel. Runs as its own task so a slow registry never stalls the
/// event stream.
fn fan_out(registry: RegistryHandle, channel: String, payload: String) {
    tokio::spawn(async move {
        let conns = registry.lookup(&channel).await;
        for conn in conns {
            if !conn.is_active() {
                continue;
            }
            if !conn.enqueue(payload.clone()) {
                warn!(client_id = %channel, conn_id = %conn.id, "send queue full, message dropped");
            }
        }
    });
}
