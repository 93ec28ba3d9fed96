//! HTTP boundary: WebSocket upgrade plus the notification REST surface.

use crate::apns::ApnsClient;
use crate::connection;
use crate::delivery::Gateway;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use ng_protocol::{ApnsMessage, NotifyBody, NotifyResponse};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    pub apns: Option<ApnsClient>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/{client_id}", get(ws_handler))
        .route("/notify/{client_id}", post(notify_handler))
        .route("/apns/{device_token}", post(apns_handler))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    "ok"
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(client_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.max_message_size(connection::MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, client_id))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, client_id: String) {
    match state.gateway.admit_connection(&client_id).await {
        Ok(admission) => {
            connection::run(socket, state.gateway.registry().clone(), admission).await;
        }
        Err(e) => {
            warn!(client_id = %client_id, error = %e, "connection rejected");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::ERROR,
                    reason: "subscribe-failed".into(),
                })))
                .await;
        }
    }
}

async fn notify_handler(
    Path(client_id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<NotifyBody>,
) -> Result<Json<NotifyResponse>, StatusCode> {
    match state
        .gateway
        .submit_notification(&client_id, &body.message)
        .await
    {
        Ok(delivered_locally) => Ok(Json(NotifyResponse { delivered_locally })),
        Err(e) => {
            warn!(client_id = %client_id, error = %e, "notification not accepted");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

async fn apns_handler(
    Path(device_token): Path<String>,
    State(state): State<AppState>,
    Json(message): Json<ApnsMessage>,
) -> StatusCode {
    let Some(apns) = state.apns.clone() else {
        debug!(device_token = %device_token, "push side channel not configured, dropping");
        return StatusCode::ACCEPTED;
    };
    info!(device_token = %device_token, "push accepted for delivery");
    // Fire and forget; the response does not wait on Apple.
    tokio::spawn(async move {
        apns.notify(&message, &device_token).await;
    });
    StatusCode::ACCEPTED
}
