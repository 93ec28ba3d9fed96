//! End-to-end flows over a real listener: WebSocket clients on one
//! side, the notification REST surface on the other, with the
//! in-memory bus standing in for Redis.

use futures_util::StreamExt;
use gateway::{AppState, build_router, wire};
use ng_bus::MemoryBus;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

const WAIT: Duration = Duration::from_secs(5);
const TICK: Duration = Duration::from_millis(10);

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_gateway(bus: MemoryBus) -> (SocketAddr, AppState) {
    let (state, _bridge) = wire(Arc::new(bus), 8, None);
    let router = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, state)
}

async fn notify(
    client: &reqwest::Client,
    addr: SocketAddr,
    client_id: &str,
    message: &str,
) -> reqwest::Response {
    client
        .post(format!("http://{addr}/notify/{client_id}"))
        .json(&serde_json::json!({ "message": message }))
        .send()
        .await
        .unwrap()
}

/// Submissions fail until the bridge's first bus epoch is armed.
async fn wait_ready(client: &reqwest::Client, addr: SocketAddr) {
    timeout(WAIT, async {
        loop {
            if notify(client, addr, "warmup", "x").await.status().is_success() {
                return;
            }
            sleep(TICK).await;
        }
    })
    .await
    .expect("gateway never became ready");
}

async fn connect_ws(addr: SocketAddr, client_id: &str) -> WsClient {
    let (ws, _resp) = connect_async(format!("ws://{addr}/ws/{client_id}"))
        .await
        .expect("websocket connect failed");
    ws
}

/// Admission runs after the upgrade handshake completes, so wait until
/// the registry actually holds the expected number of connections.
async fn wait_admitted(state: &AppState, client_id: &str, count: usize) {
    timeout(WAIT, async {
        while state.gateway.registry().lookup(client_id).await.len() != count {
            sleep(TICK).await;
        }
    })
    .await
    .expect("connection never admitted");
}

async fn next_text(ws: &mut WsClient) -> String {
    timeout(WAIT, async {
        loop {
            match ws.next().await.expect("socket closed").unwrap() {
                Message::Text(text) => return text.to_string(),
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    })
    .await
    .expect("no message arrived")
}

#[tokio::test]
async fn notification_reaches_connected_client() {
    let (addr, state) = start_gateway(MemoryBus::new()).await;
    let client = reqwest::Client::new();
    wait_ready(&client, addr).await;

    let mut ws = connect_ws(addr, "alice").await;
    wait_admitted(&state, "alice", 1).await;

    let resp = notify(&client, addr, "alice", "hello").await;
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["delivered_locally"], serde_json::json!(true));

    assert_eq!(next_text(&mut ws).await, "hello");
}

#[tokio::test]
async fn notification_without_local_listener_still_succeeds() {
    let bus = MemoryBus::new();
    let (addr, _state) = start_gateway(bus.clone()).await;
    let client = reqwest::Client::new();
    wait_ready(&client, addr).await;

    let resp = notify(&client, addr, "alice", "anyone there").await;
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["delivered_locally"], serde_json::json!(false));

    // Published to the bus regardless, for listeners elsewhere.
    timeout(WAIT, async {
        while !bus
            .published()
            .contains(&("alice".to_owned(), "anyone there".to_owned()))
        {
            sleep(TICK).await;
        }
    })
    .await
    .expect("notification never published");
}

#[tokio::test]
async fn every_connection_of_a_client_receives_the_notification() {
    let (addr, state) = start_gateway(MemoryBus::new()).await;
    let client = reqwest::Client::new();
    wait_ready(&client, addr).await;

    let mut first = connect_ws(addr, "alice").await;
    let mut second = connect_ws(addr, "alice").await;
    let mut other = connect_ws(addr, "bob").await;
    wait_admitted(&state, "alice", 2).await;
    wait_admitted(&state, "bob", 1).await;

    notify(&client, addr, "alice", "fan-out").await;

    assert_eq!(next_text(&mut first).await, "fan-out");
    assert_eq!(next_text(&mut second).await, "fan-out");

    // Bob hears nothing from Alice's notification.
    notify(&client, addr, "bob", "own message").await;
    assert_eq!(next_text(&mut other).await, "own message");
}

#[tokio::test]
async fn closing_the_last_connection_unsubscribes_the_client() {
    let bus = MemoryBus::new();
    let (addr, state) = start_gateway(bus.clone()).await;
    let client = reqwest::Client::new();
    wait_ready(&client, addr).await;

    let mut first = connect_ws(addr, "alice").await;
    let mut second = connect_ws(addr, "alice").await;
    wait_admitted(&state, "alice", 2).await;
    assert_eq!(bus.subscribe_count("alice"), 1);

    first.close(None).await.unwrap();
    wait_admitted(&state, "alice", 1).await;
    assert_eq!(bus.unsubscribe_count("alice"), 0);

    // The surviving socket still receives.
    notify(&client, addr, "alice", "still here").await;
    assert_eq!(next_text(&mut second).await, "still here");

    second.close(None).await.unwrap();
    wait_admitted(&state, "alice", 0).await;
    assert_eq!(bus.unsubscribe_count("alice"), 1);
    assert!(!bus.is_subscribed("alice"));
}

#[tokio::test]
async fn connection_is_rejected_while_the_bus_is_down() {
    let bus = MemoryBus::new();
    bus.fail_next_connect(usize::MAX);
    let (addr, _state) = start_gateway(bus).await;

    let mut ws = connect_ws(addr, "alice").await;
    let frame = timeout(WAIT, ws.next())
        .await
        .expect("no close frame")
        .expect("socket ended")
        .unwrap();
    match frame {
        Message::Close(Some(close)) => {
            assert_eq!(close.code, CloseCode::Error);
            assert_eq!(close.reason.as_str(), "subscribe-failed");
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn healthz_answers() {
    let (addr, _state) = start_gateway(MemoryBus::new()).await;
    let resp = reqwest::get(format!("http://{addr}/healthz")).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn gateway_recovers_after_a_bus_failure() {
    let bus = MemoryBus::new();
    let (addr, state) = start_gateway(bus.clone()).await;
    let client = reqwest::Client::new();
    wait_ready(&client, addr).await;

    bus.fail_receive();

    // After reconnection, a fresh client gets full service again.
    let mut ws = timeout(Duration::from_secs(10), async {
        loop {
            sleep(Duration::from_millis(25)).await;
            if let Ok((ws, _)) = connect_async(format!("ws://{addr}/ws/carol")).await {
                if !state.gateway.registry().lookup("carol").await.is_empty() {
                    return ws;
                }
                // Admission may still be in flight; check once more
                // before discarding this socket.
                sleep(Duration::from_millis(25)).await;
                if !state.gateway.registry().lookup("carol").await.is_empty() {
                    return ws;
                }
            }
        }
    })
    .await
    .expect("gateway never recovered");

    let resp = notify(&client, addr, "carol", "back up").await;
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(next_text(&mut ws).await, "back up");
}
