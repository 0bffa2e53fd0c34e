//! 방 할당 TCP 채팅 서버

mod allocator;
mod config;
mod directory;
mod error;
mod handlers;
mod protocol;
mod replay;
mod room;
mod session;
mod state;
mod store;

use anyhow::Context;
use axum::{routing::get, Router};
use config::Config;
use state::AppState;
use std::sync::Arc;
use store::{JsonFileUserStore, MemoryUserStore, UserStore};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();

    // 로깅 초기화
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.log_level))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let user_store: Arc<dyn UserStore> = match &config.user_store_path {
        Some(path) => Arc::new(
            JsonFileUserStore::open(path)
                .with_context(|| format!("failed to open user store at {path}"))?,
        ),
        None => Arc::new(MemoryUserStore::new()),
    };

    let state = Arc::new(AppState::new(config.clone(), user_store));

    // 방 할당 현황 로거
    if config.stats_interval_secs > 0 {
        let stats_state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(
                stats_state.config.stats_interval_secs,
            ));
            loop {
                interval.tick().await;
                handlers::log_allocation(&stats_state);
            }
        });
    }

    if config.http_port > 0 {
        spawn_http(state.clone(), &config).await?;
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind chat listener on {addr}"))?;

    tracing::info!("🚀 Chatroom server started");
    tracing::info!("Chat address: {}", addr);
    tracing::info!(
        max_rooms = config.allocator.max_room_count,
        room_capacity = config.room.capacity,
        "Allocation limits"
    );

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(peer = %peer, "Accepted connection");
                tokio::spawn(handlers::handle_tcp(state.clone(), stream));
            }
            Err(e) => tracing::warn!(error = %e, "Accept failed"),
        }
    }
}

async fn spawn_http(state: Arc<AppState>, config: &Config) -> anyhow::Result<()> {
    // CORS 설정
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(handlers::index_handler))
        .route("/health", get(handlers::health_handler))
        .route("/stats", get(handlers::stats_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.http_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind stats listener on {addr}"))?;
    tracing::info!("Stats: http://{}/stats", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "Stats server stopped");
        }
    });
    Ok(())
}
