// ABOUTME: Chat server binary: one instance of the horizontally scaled chat room
// ABOUTME: Serves WebSocket clients and coordinates with its peers through Redis

mod ws;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chat_cluster::{ChatInstance, InstanceConfig, RedisStore, METRICS};
use dotenv::dotenv;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::Notify;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_PORT: u16 = 5000;

#[derive(Clone)]
pub struct AppState {
    pub instance: Arc<ChatInstance>,
}

/// 200 while the instance can reach Redis, 503 while it is degraded.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.instance.status();
    let code = if status.degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json((*status).clone()))
}

/// GET /metrics - Prometheus-formatted metrics endpoint
async fn metrics() -> impl IntoResponse {
    (
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        METRICS.to_prometheus(),
    )
}

fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_credentials(false);

    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn init_tracing() {
    // JSON in production for log aggregation
    let is_production = env::var("NODE_ENV").unwrap_or_default() == "production";
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if is_production {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => tracing::info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let worker_threads = env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| num_cpus::get().max(2));

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?
        .block_on(async_main(worker_threads))
}

async fn async_main(worker_threads: usize) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = InstanceConfig::from_env()?;
    let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string());
    let port = env::var("PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);

    let store = RedisStore::connect(&redis_url).await?;
    tracing::info!("✔︎ Connected to Redis at {}", redis_url);

    let instance = Arc::new(ChatInstance::start(Arc::new(store), config).await?);
    tracing::info!(
        instance_id = %instance.instance_id(),
        worker_threads,
        "✔︎ Joined chat cluster"
    );

    let app = app(AppState {
        instance: instance.clone(),
    });

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("🌐 Chat server listening on {}", addr);

    let shutdown_signal = Arc::new(Notify::new());
    let shutdown_for_server = shutdown_signal.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_for_server.notified().await;
            })
            .await
    });

    wait_for_shutdown_signal().await;
    tracing::info!("Shutting down gracefully...");

    // Releasing the instance first closes every client session, which lets
    // the WebSocket tasks finish before the server drains
    if let Err(e) = instance.shutdown().await {
        tracing::warn!("Chat instance shutdown incomplete: {}", e);
    }
    shutdown_signal.notify_one();

    match tokio::time::timeout(Duration::from_secs(10), server_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::warn!("HTTP server error: {}", e),
        Ok(Err(e)) => tracing::warn!("HTTP server task error: {:?}", e),
        Err(_) => tracing::warn!("HTTP server shutdown timed out after 10s"),
    }

    tracing::info!("Graceful shutdown complete");
    Ok(())
}
