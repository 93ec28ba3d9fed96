//! Gateway configuration.
//!
//! Environment variables are the sole config source:
//! - `BIND_ADDR` — HTTP/WebSocket listen address (default `0.0.0.0:8080`)
//! - `REDIS_URL` — bus server (default `redis://127.0.0.1:6379`)
//! - `PUBLISH_QUEUE` — bound of the notification publish queue (default 50)
//! - `APNS_ENDPOINT`, `APNS_TOKEN` — push side channel; unset disables it
//! - `LOG_LEVEL` — tracing filter, read in `main`

use std::env;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_PUBLISH_QUEUE: usize = 50;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub redis_url: String,
    /// Capacity of the bounded queue between notification submission
    /// and the bus publish task. Submissions block once it fills.
    pub publish_queue: usize,
    pub apns_endpoint: Option<String>,
    pub apns_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let publish_queue = lookup("PUBLISH_QUEUE")
            .and_then(|v| v.parse().ok())
            .filter(|&n: &usize| n > 0)
            .unwrap_or(DEFAULT_PUBLISH_QUEUE);
        Self {
            bind_addr: lookup("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_owned()),
            redis_url: lookup("REDIS_URL").unwrap_or_else(|| DEFAULT_REDIS_URL.to_owned()),
            publish_queue,
            apns_endpoint: lookup("APNS_ENDPOINT"),
            apns_token: lookup("APNS_TOKEN"),
        }
    }
}
