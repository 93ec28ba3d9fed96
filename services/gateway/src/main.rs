use gateway::apns::ApnsClient;
use gateway::{Config, build_router, wire};
use ng_bus::RedisBus;
use std::env;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config = Config::from_env();
    let apns = ApnsClient::from_config(&config);
    if apns.is_none() {
        info!("push side channel not configured");
    }

    let bus = RedisBus::new(&config.redis_url).expect("invalid REDIS_URL");
    let (state, _bridge) = wire(Arc::new(bus), config.publish_queue, apns);

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %config.bind_addr, redis = %config.redis_url, "gateway listening");
    axum::serve(listener, router).await.expect("server error");
}
