//! Connection registry: the single owner of the client-id → connections
//! mapping.
//!
//! The mapping is owned by one task that processes commands from an
//! mpsc channel, so admissions, removals, and fan-out lookups are
//! serialized without a shared lock. The subscribe/unsubscribe decision
//! and the map mutation happen inside a single command turn, which is
//! what keeps the bus subscription state and the map in step: no other
//! command can observe a client id that is empty-but-subscribed or
//! non-empty-but-unsubscribed.

use ng_bus::{BusError, BusSubscriber};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Capacity of each connection's outbound message queue.
pub const SEND_QUEUE_CAPACITY: usize = 256;

const COMMAND_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("bus subscribe failed for client {client_id}")]
    SubscribeFailed {
        client_id: String,
        #[source]
        source: BusError,
    },
    #[error("registry task is gone")]
    Closed,
}

/// Registry-side record of one live connection.
///
/// Shared between the registry (for fan-out lookup) and the
/// connection's own send/receive loops (for liveness bookkeeping).
#[derive(Debug)]
pub struct ConnectionEntry {
    pub client_id: String,
    pub id: Uuid,
    outbound: mpsc::Sender<String>,
    active: AtomicBool,
}

impl ConnectionEntry {
    fn new(client_id: String, outbound: mpsc::Sender<String>) -> Self {
        Self {
            client_id,
            id: Uuid::new_v4(),
            outbound,
            active: AtomicBool::new(true),
        }
    }

    /// Non-blocking enqueue onto the outbound queue. Returns false if
    /// the queue is full or closed; the caller drops the message for
    /// this connection only.
    pub fn enqueue(&self, message: String) -> bool {
        self.outbound.try_send(message).is_ok()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// One-way transition; an inactive connection never comes back.
    pub(crate) fn mark_inactive(&self) {
        self.active.store(false, Ordering::Release);
    }
}

/// What a successful admission hands to the connection handler: the
/// shared entry plus the receive side of its outbound queue.
#[derive(Debug)]
pub struct Admission {
    pub entry: Arc<ConnectionEntry>,
    pub outbound_rx: mpsc::Receiver<String>,
}

enum Command {
    Admit {
        client_id: String,
        reply: oneshot::Sender<Result<Admission, RegistryError>>,
    },
    Remove {
        client_id: String,
        conn_id: Uuid,
        reply: oneshot::Sender<()>,
    },
    Lookup {
        client_id: String,
        reply: oneshot::Sender<Vec<Arc<ConnectionEntry>>>,
    },
    SwapSubscriber {
        subscriber: Arc<dyn BusSubscriber>,
    },
}

/// Cheap-to-clone handle to the registry task.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<Command>,
}

impl RegistryHandle {
    /// Spawn the registry task. Until the bridge installs a live bus
    /// subscriber, all first-connection admissions are rejected.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        tokio::spawn(run(rx));
        Self { tx }
    }

    /// Admit a new connection for `client_id`, subscribing the client
    /// id on the bus first if this is its first local connection.
    pub async fn admit(&self, client_id: &str) -> Result<Admission, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Admit {
                client_id: client_id.to_owned(),
                reply,
            })
            .await
            .map_err(|_| RegistryError::Closed)?;
        rx.await.map_err(|_| RegistryError::Closed)?
    }

    /// Remove a connection by identity. Idempotent: removing an absent
    /// connection is a no-op. Unsubscribes the client id from the bus
    /// when the last connection goes.
    pub async fn remove(&self, client_id: &str, conn_id: Uuid) {
        let (reply, rx) = oneshot::channel();
        let sent = self
            .tx
            .send(Command::Remove {
                client_id: client_id.to_owned(),
                conn_id,
                reply,
            })
            .await
            .is_ok();
        if sent {
            let _ = rx.await;
        }
    }

    /// All live connections for `client_id`, in admission order.
    pub async fn lookup(&self, client_id: &str) -> Vec<Arc<ConnectionEntry>> {
        let (reply, rx) = oneshot::channel();
        let sent = self
            .tx
            .send(Command::Lookup {
                client_id: client_id.to_owned(),
                reply,
            })
            .await
            .is_ok();
        if sent {
            rx.await.unwrap_or_default()
        } else {
            Vec::new()
        }
    }

    /// Install the subscriber for the current bus epoch. Called by the
    /// bridge each time it (re)connects.
    pub async fn swap_subscriber(&self, subscriber: Arc<dyn BusSubscriber>) {
        let _ = self.tx.send(Command::SwapSubscriber { subscriber }).await;
    }
}

/// Placeholder installed before the bridge's first successful connect;
/// rejects every subscribe so admissions fail cleanly.
struct NoBus;

#[async_trait::async_trait]
impl BusSubscriber for NoBus {
    async fn subscribe(&self, _channel: &str) -> Result<(), BusError> {
        Err(BusError::NotConnected)
    }

    async fn unsubscribe(&self, _channel: &str) -> Result<(), BusError> {
        Err(BusError::NotConnected)
    }
}

async fn run(mut rx: mpsc::Receiver<Command>) {
    let mut subscriber: Arc<dyn BusSubscriber> = Arc::new(NoBus);
    let mut connections: HashMap<String, Vec<Arc<ConnectionEntry>>> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Admit { client_id, reply } => {
                // Subscribe before the first connection exists, so a
                // subscribed client id always has a map entry by the
                // time any other command runs.
                if !connections.contains_key(&client_id) {
                    if let Err(source) = subscriber.subscribe(&client_id).await {
                        warn!(client_id = %client_id, error = %source, "bus subscribe failed, rejecting connection");
                        let _ = reply.send(Err(RegistryError::SubscribeFailed {
                            client_id,
                            source,
                        }));
                        continue;
                    }
                }
                let (tx, outbound_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
                let entry = Arc::new(ConnectionEntry::new(client_id.clone(), tx));
                info!(client_id = %client_id, conn_id = %entry.id, "connection admitted");
                connections.entry(client_id).or_default().push(entry.clone());
                let _ = reply.send(Ok(Admission { entry, outbound_rx }));
            }
            Command::Remove {
                client_id,
                conn_id,
                reply,
            } => {
                if let Some(conns) = connections.get_mut(&client_id) {
                    if conns.iter().any(|c| c.id == conn_id) {
                        if conns.len() == 1 {
                            // Last connection: release the bus channel
                            // before dropping the map entry.
                            if let Err(e) = subscriber.unsubscribe(&client_id).await {
                                warn!(client_id = %client_id, error = %e, "bus unsubscribe failed");
                            }
                            connections.remove(&client_id);
                        } else {
                            conns.retain(|c| c.id != conn_id);
                        }
                        info!(client_id = %client_id, conn_id = %conn_id, "connection removed");
                    }
                }
                let _ = reply.send(());
            }
            Command::Lookup { client_id, reply } => {
                let conns = connections.get(&client_id).cloned().unwrap_or_default();
                let _ = reply.send(conns);
            }
            Command::SwapSubscriber { subscriber: s } => {
                debug!("bus subscriber swapped");
                subscriber = s;
            }
        }
    }
}
