mod cache;
mod credentials;
mod http;
mod meli;
mod metrics;
mod models;
mod queue;
mod store;
mod sync;
mod worker;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use cache::{MarkerCache, RedisMarkerCache};
use credentials::{CredentialResolver, RestCredentialResolver};
use meli::{MarketplaceApi, MeliClient};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, OrderNotification};
use queue::{OrderQueue, RedisOrderQueue};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use store::{OrderStore, RestOrderStore};
use sync::OrderSyncService;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "stocksync.api", "server crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("prom recorder");

    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let redis = redis::Client::open(redis_url)?;

    let http_client = http::build_client();
    let queue: Arc<dyn OrderQueue> = Arc::new(RedisOrderQueue::new(redis.clone()));
    let cache: Arc<dyn MarkerCache> = Arc::new(RedisMarkerCache::new(redis));
    let store: Arc<dyn OrderStore> = Arc::new(
        RestOrderStore::from_env(http_client.clone())
            .ok_or("STORE_API_URL and STORE_API_KEY must be set")?,
    );
    let resolver: Arc<dyn CredentialResolver> = Arc::new(
        RestCredentialResolver::from_env(http_client.clone())
            .ok_or("STORE_API_URL and STORE_API_KEY must be set")?,
    );
    let marketplace: Arc<dyn MarketplaceApi> = Arc::new(MeliClient::new(http_client));

    let service = Arc::new(OrderSyncService::new(
        queue.clone(),
        marketplace,
        resolver,
        store,
        cache,
    ));
    let (_poller, _worker) = worker::spawn(service, queue.clone());

    let state = AppState {
        queue,
        prometheus_handle,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/webhooks/meli-orders", post(receive_order_notification))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "stocksync.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    queue: Arc<dyn OrderQueue>,
    prometheus_handle: PrometheusHandle,
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "stocksync-rs",
    }))
}

/// Marketplace order webhook intake.
///
/// - Method: `POST`
/// - Path: `/webhooks/meli-orders`
/// - Body: `OrderNotification`
///
/// The notification is enqueued for asynchronous processing; the 200 only
/// confirms receipt, not that the order was synchronized.
async fn receive_order_notification(
    State(state): State<AppState>,
    Json(notification): Json<OrderNotification>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    crate::metrics::inc_requests("/webhooks/meli-orders");
    info!(
        target = "stocksync.api",
        notification_id = %notification.id,
        user_id = notification.user_id,
        attempts = notification.attempts,
        "order notification received"
    );
    match state.queue.publish(&notification).await {
        Ok(()) => Ok(StatusCode::OK),
        Err(err) => {
            error!(
                target = "stocksync.api",
                notification_id = %notification.id,
                error = %err,
                "failed to enqueue the order notification"
            );
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError {
                    error: "enqueue_failed".to_string(),
                    detail: Some(err.to_string()),
                }),
            ))
        }
    }
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(axum::http::StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap()
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
