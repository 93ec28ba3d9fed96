//! Fire-and-forget push side channel.
//!
//! Pushes ride outside the delivery path entirely: a failed push is
//! logged and forgotten, and nothing here touches the registry or the
//! bus. The client is only constructed when both the endpoint and the
//! token are configured.

use crate::config::Config;
use ng_protocol::ApnsMessage;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct ApnsClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
}

impl ApnsClient {
    /// Build a client from config; `None` when the side channel is not
    /// configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        let endpoint = config.apns_endpoint.clone()?;
        let token = config.apns_token.clone()?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .ok()?;
        Some(Self {
            http,
            endpoint,
            token,
        })
    }

    /// Send one push to `device_token`. Never fails from the caller's
    /// perspective.
    pub async fn notify(&self, message: &ApnsMessage, device_token: &str) {
        let url = format!(
            "{}/3/device/{device_token}",
            self.endpoint.trim_end_matches('/')
        );
        let payload = json!({
            "aps": {
                "alert": message.message,
                "badge": message.badge,
                "sound": message.sound,
            }
        });
        match self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                debug!(device_token = %device_token, "push accepted");
            }
            Ok(resp) => {
                warn!(device_token = %device_token, status = %resp.status(), "push rejected");
            }
            Err(e) => {
                warn!(device_token = %device_token, error = %e, "push request failed");
            }
        }
    }
}
