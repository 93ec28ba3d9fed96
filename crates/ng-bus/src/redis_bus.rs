//! Redis pub/sub implementation of the bus boundary.
//!
//! Each `connect()` opens a dedicated pub/sub connection, split into a
//! sink (subscribe/unsubscribe, shared behind a mutex so the registry
//! can call it concurrently with the bridge) and a message stream,
//! plus a multiplexed connection for publishing. All three belong to
//! one epoch and are dropped together on failure.

use crate::{BusConnector, BusError, BusEvent, BusEvents, BusParts, BusPublisher, BusSubscriber};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use redis::aio::{MultiplexedConnection, PubSubSink, PubSubStream};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Connector backed by a Redis server.
pub struct RedisBus {
    client: redis::Client,
}

impl RedisBus {
    /// Create a connector for `url` (e.g. `redis://127.0.0.1:6379`).
    /// No connection is attempted until `connect()`.
    pub fn new(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(|e| BusError::Connect(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl BusConnector for RedisBus {
    async fn connect(&self) -> Result<BusParts, BusError> {
        let pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        let (sink, stream) = pubsub.split();
        let publish_conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;

        Ok(BusParts {
            subscriber: Arc::new(RedisSubscriber {
                sink: Mutex::new(sink),
            }),
            publisher: Arc::new(RedisPublisher { conn: publish_conn }),
            events: Box::new(RedisEvents { stream }),
        })
    }
}

struct RedisSubscriber {
    sink: Mutex<PubSubSink>,
}

#[async_trait]
impl BusSubscriber for RedisSubscriber {
    async fn subscribe(&self, channel: &str) -> Result<(), BusError> {
        debug!(channel = %channel, "redis subscribe");
        self.sink
            .lock()
            .await
            .subscribe(channel)
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError> {
        debug!(channel = %channel, "redis unsubscribe");
        self.sink
            .lock()
            .await
            .unsubscribe(channel)
            .await
            .map_err(|e| BusError::Unsubscribe(e.to_string()))
    }
}

struct RedisPublisher {
    conn: MultiplexedConnection,
}

#[async_trait]
impl BusPublisher for RedisPublisher {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }
}

struct RedisEvents {
    stream: PubSubStream,
}

#[async_trait]
impl BusEvents for RedisEvents {
    async fn next_event(&mut self) -> Result<BusEvent, BusError> {
        match self.stream.next().await {
            Some(msg) => Ok(decode_message(&msg)),
            // Stream end means the server connection is gone; the
            // bridge reacts by rebuilding the whole epoch.
            None => Err(BusError::Receive("pub/sub stream closed".to_owned())),
        }
    }
}

/// A payload that fails to decode only costs that one message, never
/// the connection.
fn decode_message(msg: &redis::Msg) -> BusEvent {
    let channel = msg.get_channel_name().to_owned();
    match msg.get_payload::<String>() {
        Ok(payload) => BusEvent::Message { channel, payload },
        Err(e) => {
            warn!(channel = %channel, error = %e, "undecodable pub/sub payload, skipping");
            BusEvent::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::{PushKind, Value};

    fn pubsub_msg(channel: &[u8], payload: &[u8]) -> redis::Msg {
        redis::Msg::from_owned_value(Value::Push {
            kind: PushKind::Message,
            data: vec![
                Value::BulkString(channel.to_vec()),
                Value::BulkString(payload.to_vec()),
            ],
        })
        .expect("valid pub/sub push")
    }

    #[test]
    fn text_payload_decodes_to_message() {
        assert_eq!(
            decode_message(&pubsub_msg(b"alice", b"hi")),
            BusEvent::Message {
                channel: "alice".to_owned(),
                payload: "hi".to_owned()
            }
        );
    }

    #[test]
    fn undecodable_payload_is_skipped_without_failing_the_stream() {
        assert_eq!(
            decode_message(&pubsub_msg(b"alice", &[0xff, 0xfe, 0xfd])),
            BusEvent::Unknown
        );
    }
}
