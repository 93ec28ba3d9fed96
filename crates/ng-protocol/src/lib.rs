//! HTTP body types shared by the gateway service and its tests.

use serde::{Deserialize, Serialize};

/// Body of `POST /notify/{client_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyBody {
    pub message: String,
}

/// Response of `POST /notify/{client_id}`.
///
/// `delivered_locally` is advisory: it reports whether at least one
/// connection for the client id was live on *this* instance at
/// submission time. It does not confirm delivery anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyResponse {
    pub delivered_locally: bool,
}

/// Body of `POST /apns/{device_token}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApnsMessage {
    pub message: String,
    #[serde(default)]
    pub badge: u32,
    #[serde(default)]
    pub sound: String,
}
