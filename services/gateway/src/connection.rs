//! Per-connection send and receive loops.
//!
//! Each admitted WebSocket gets two tasks over the split socket halves.
//! The send loop drains the connection's outbound queue and keeps the
//! peer alive with periodic pings; the receive loop enforces the pong
//! deadline and notices peer-initiated closes. Either side failing
//! cancels the other through a shared token, and the send loop alone
//! performs the registry removal so it happens exactly once.

use crate::registry::{Admission, ConnectionEntry, RegistryHandle};
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, timeout};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Deadline for any single write to the peer.
pub(crate) const WRITE_WAIT: Duration = Duration::from_secs(10);
/// The peer is dead if nothing arrives for this long.
pub(crate) const PONG_WAIT: Duration = Duration::from_secs(30);
/// Ping interval; must fire well inside `PONG_WAIT`.
pub(crate) const PING_PERIOD: Duration = Duration::from_secs(20);
/// Largest inbound frame accepted from a client.
pub const MAX_MESSAGE_SIZE: usize = 512;

/// Drive an admitted connection until it dies, then remove it from the
/// registry.
pub async fn run(socket: WebSocket, registry: RegistryHandle, admission: Admission) {
    let Admission { entry, outbound_rx } = admission;
    let (sink, stream) = socket.split();

    let cancel = CancellationToken::new();
    let receiver = tokio::spawn(receive_loop(stream, cancel.clone(), entry.clone()));
    send_loop(sink, outbound_rx, cancel, entry, registry).await;
    let _ = receiver.await;
}

async fn send_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
    cancel: CancellationToken,
    entry: Arc<ConnectionEntry>,
    registry: RegistryHandle,
) {
    let mut ping = tokio::time::interval(PING_PERIOD);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick fires immediately; the peer just connected.
    ping.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            msg = outbound.recv() => {
                let Some(text) = msg else { break };
                if write(&mut sink, Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if write(&mut sink, Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    // Stop accepting fan-out before the registry forgets us, so no
    // message is queued onto a connection that will never drain it.
    entry.mark_inactive();
    cancel.cancel();
    registry.remove(&entry.client_id, entry.id).await;
    let _ = timeout(WRITE_WAIT, sink.send(Message::Close(None))).await;
    debug!(client_id = %entry.client_id, conn_id = %entry.id, "send loop finished");
}

async fn write(sink: &mut SplitSink<WebSocket, Message>, msg: Message) -> Result<(), ()> {
    match timeout(WRITE_WAIT, sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!(error = %e, "websocket write failed");
            Err(())
        }
        Err(_) => {
            debug!("websocket write timed out");
            Err(())
        }
    }
}

/// Reads frames only to observe liveness. Any frame, pongs included,
/// refreshes the deadline; clients are not expected to send data.
async fn receive_loop(
    mut stream: SplitStream<WebSocket>,
    cancel: CancellationToken,
    entry: Arc<ConnectionEntry>,
) {
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            f = timeout(PONG_WAIT, stream.next()) => f,
        };
        match frame {
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                debug!(client_id = %entry.client_id, conn_id = %entry.id, "peer closed");
                break;
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => {
                debug!(client_id = %entry.client_id, conn_id = %entry.id, error = %e, "websocket read failed");
                break;
            }
            Err(_) => {
                debug!(client_id = %entry.client_id, conn_id = %entry.id, "liveness deadline expired");
                break;
            }
        }
    }
    cancel.cancel();
}
