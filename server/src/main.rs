mod analytics;
mod auth;
mod collab;
mod config;
mod db;
mod documents;
mod error;
mod model;
mod notes;
mod render;

use std::env;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use axum_client_ip::ClientIpSource;
use lumina_collab::{CollabEngine, EngineConfig};
use redis::aio::ConnectionManager;
use tower::ServiceBuilder;
use tracing_subscriber::filter;

use collab::PostgresDocumentStore;
use render::RenderTracker;

async fn health(
    Extension(redis_conn): Extension<Option<ConnectionManager>>,
) -> Json<serde_json::Value> {
    let database = if db::ping() { "connected" } else { "disconnected" };

    let redis_up = match redis_conn {
        Some(mut conn) => redis::cmd("PING").query_async::<()>(&mut conn).await.is_ok(),
        None => false,
    };

    Json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "services": {
            "database": database,
            "redis": if redis_up { "connected" } else { "disconnected" },
        },
    }))
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "Not found" })),
    )
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_level(true)
        .pretty()
        .with_max_level(filter::LevelFilter::INFO)
        .init();
    tracing::info!("starting lumina server");

    let ip_source_env = env::var("IP_SOURCE").unwrap_or_else(|_| "nginx".to_string());
    let ip_source = match ip_source_env.as_str() {
        "nginx" => ClientIpSource::RightmostXForwardedFor,
        "amazon" => ClientIpSource::CloudFrontViewerAddress,
        _ => {
            tracing::warn!("Unknown IP source: {}, defaulting to Nginx", ip_source_env);
            ClientIpSource::RightmostXForwardedFor
        }
    };

    // Redis is optional: without it the health probe reports disconnected
    // and collab updates stay within this instance.
    let (publisher, redis_client) = match redis::Client::open(config::redis_url()) {
        Ok(client) => match ConnectionManager::new(client.clone()).await {
            Ok(manager) => (Some(manager), Some(client)),
            Err(e) => {
                tracing::warn!("redis unavailable, running standalone: {}", e);
                (None, None)
            }
        },
        Err(e) => {
            tracing::warn!("invalid REDIS_URL, running standalone: {}", e);
            (None, None)
        }
    };

    let mut engine = CollabEngine::new(Arc::new(PostgresDocumentStore), EngineConfig::default());
    if let Some(manager) = publisher.clone() {
        engine = engine.with_publisher(manager);
    }
    let engine = Arc::new(engine);

    let tracker = Arc::new(RenderTracker::new());

    tokio::spawn(notes::run_expiry_sweeper());
    {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run_flush_loop().await });
    }
    if let Some(client) = redis_client {
        tokio::spawn(engine.clone().run_redis_subscriber(client));
    }

    let app = Router::new()
        .route("/api/health", get(health))
        .nest("/api/auth", auth::routes())
        .nest("/api/analytics", analytics::routes())
        .nest("/api/documents", documents::routes())
        .nest("/api/notes", notes::routes())
        .nest("/api/videos", render::routes())
        .route("/", get(collab::ws_handler))
        .fallback(not_found)
        .layer(
            ServiceBuilder::new()
                .layer(Extension(engine.clone()))
                .layer(Extension(tracker))
                .layer(Extension(publisher))
                .layer(ip_source.into_extension()),
        );

    let port = config::port();
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .expect("Failed to bind TCP listener");
    tracing::info!("listening on 0.0.0.0:{}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Failed to start server");

    // Open documents may sit inside their debounce window; save them now.
    tracing::info!("shutting down, flushing open documents");
    engine.flush_all().await;
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
    }
}
