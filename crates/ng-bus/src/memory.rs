//! In-process bus used by tests and for running the gateway without a
//! Redis server.
//!
//! All handles produced by `connect()` share one broker state, so a
//! publish is delivered to the current epoch's event stream whenever
//! the channel is subscribed. The broker records every subscribe,
//! unsubscribe, and publish so tests can assert on bus traffic, and
//! supports fault injection (`fail_receive`, `fail_next_connect`) for
//! reconnection tests.

use crate::{BusConnector, BusError, BusEvent, BusEvents, BusParts, BusPublisher, BusSubscriber};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// A recorded bus operation, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusOp {
    Subscribe(String),
    Unsubscribe(String),
    Publish { channel: String, payload: String },
}

#[derive(Default)]
struct EpochState {
    subs: HashSet<String>,
    tx: Option<mpsc::UnboundedSender<Result<BusEvent, BusError>>>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<EpochState>,
    ops: Mutex<Vec<BusOp>>,
    connect_failures: AtomicUsize,
}

/// In-memory single-process bus.
#[derive(Clone, Default)]
pub struct MemoryBus {
    shared: Arc<Shared>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// All operations recorded so far.
    pub fn ops(&self) -> Vec<BusOp> {
        self.shared.ops.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn subscribe_count(&self, channel: &str) -> usize {
        self.ops()
            .iter()
            .filter(|op| matches!(op, BusOp::Subscribe(c) if c == channel))
            .count()
    }

    pub fn unsubscribe_count(&self, channel: &str) -> usize {
        self.ops()
            .iter()
            .filter(|op| matches!(op, BusOp::Unsubscribe(c) if c == channel))
            .count()
    }

    /// Payloads published so far, as `(channel, payload)` pairs.
    pub fn published(&self) -> Vec<(String, String)> {
        self.ops()
            .iter()
            .filter_map(|op| match op {
                BusOp::Publish { channel, payload } => {
                    Some((channel.clone(), payload.clone()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .subs
            .contains(channel)
    }

    /// Deliver a payload as if published by another gateway instance.
    /// Returns true if the current epoch is subscribed to `channel`.
    pub fn deliver(&self, channel: &str, payload: &str) -> bool {
        let state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.subs.contains(channel) {
            return false;
        }
        match &state.tx {
            Some(tx) => tx
                .send(Ok(BusEvent::Message {
                    channel: channel.to_owned(),
                    payload: payload.to_owned(),
                }))
                .is_ok(),
            None => false,
        }
    }

    /// Deliver a liveness reply from the bus itself.
    pub fn deliver_pong(&self) {
        let state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = &state.tx {
            let _ = tx.send(Ok(BusEvent::Pong));
        }
    }

    /// Inject a receive error into the current epoch's event stream.
    pub fn fail_receive(&self) {
        let state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = &state.tx {
            let _ = tx.send(Err(BusError::Receive("injected failure".to_owned())));
        }
    }

    /// Make the next `n` calls to `connect()` fail.
    pub fn fail_next_connect(&self, n: usize) {
        self.shared.connect_failures.store(n, Ordering::SeqCst);
    }

    fn record(&self, op: BusOp) {
        self.shared
            .ops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(op);
    }
}

#[async_trait]
impl BusConnector for MemoryBus {
    async fn connect(&self) -> Result<BusParts, BusError> {
        let failures = &self.shared.connect_failures;
        if failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BusError::Connect("injected connect failure".to_owned()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            // A fresh connection carries no subscriptions, like Redis.
            state.subs.clear();
            state.tx = Some(tx);
        }

        Ok(BusParts {
            subscriber: Arc::new(MemoryHandle { bus: self.clone() }),
            publisher: Arc::new(MemoryHandle { bus: self.clone() }),
            events: Box::new(MemoryEvents { rx }),
        })
    }
}

struct MemoryHandle {
    bus: MemoryBus,
}

#[async_trait]
impl BusSubscriber for MemoryHandle {
    async fn subscribe(&self, channel: &str) -> Result<(), BusError> {
        {
            let mut state = self
                .bus
                .shared
                .state
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            state.subs.insert(channel.to_owned());
            let count = state.subs.len();
            if let Some(tx) = &state.tx {
                let _ = tx.send(Ok(BusEvent::Subscription {
                    channel: channel.to_owned(),
                    count,
                }));
            }
        }
        self.bus.record(BusOp::Subscribe(channel.to_owned()));
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError> {
        {
            let mut state = self
                .bus
                .shared
                .state
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            state.subs.remove(channel);
        }
        self.bus.record(BusOp::Unsubscribe(channel.to_owned()));
        Ok(())
    }
}

#[async_trait]
impl BusPublisher for MemoryHandle {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        self.bus.record(BusOp::Publish {
            channel: channel.to_owned(),
            payload: payload.to_owned(),
        });
        self.bus.deliver(channel, payload);
        Ok(())
    }
}

struct MemoryEvents {
    rx: mpsc::UnboundedReceiver<Result<BusEvent, BusError>>,
}

#[async_trait]
impl BusEvents for MemoryEvents {
    async fn next_event(&mut self) -> Result<BusEvent, BusError> {
        match self.rx.recv().await {
            Some(event) => event,
            None => Err(BusError::Receive("memory bus closed".to_owned())),
        }
    }
}
