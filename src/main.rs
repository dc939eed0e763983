//! Property Assist - property maintenance and tenancy assistant
//!
//! A Rust backend that routes each request to specialized handlers,
//! runs them concurrently and merges their validated outputs into one
//! response per turn.

mod api;
mod assembler;
mod classifier;
mod config;
mod conversation;
mod db;
mod handlers;
mod llm;
mod runtime;
mod schema;
mod state_machine;

use api::{create_router, AppState};
use config::AppConfig;
use db::Database;
use handlers::HandlerSet;
use llm::ModelRegistry;
use runtime::{Assistant, DatabaseSessionStore, RegistryLlmClient};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "property_assist=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = AppConfig::from_env()?;

    // Ensure database directory exists
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.db_path.display(), "Opening database");
    let db = Database::open(&config.db_path)?;
    tracing::info!(sessions = db.session_count()?, "Database ready");

    let classifier = Arc::new(config.classifier()?);
    if let Some(path) = &config.routing_policy {
        tracing::info!(path = %path.display(), "Loaded routing policy");
    }

    // Initialize LLM registry
    let llm_registry = Arc::new(ModelRegistry::new(&config.llm_config()));
    if llm_registry.available_models().is_empty() {
        tracing::warn!("No LLM API keys configured. Set GOOGLE_API_KEY or LLM_GATEWAY.");
    } else {
        tracing::info!(
            models = ?llm_registry.available_models(),
            default = %llm_registry.default_model_id(),
            "LLM registry initialized"
        );
    }
    let llm = Arc::new(RegistryLlmClient::new(
        llm_registry.clone(),
        llm_registry.default_model_id().to_string(),
    ));

    let handlers = HandlerSet::standard(llm.clone(), llm, classifier.clone());
    let assistant = Assistant::new(
        classifier,
        handlers,
        Arc::new(DatabaseSessionStore::new(db)),
    )
    .with_handler_timeout(config.handler_timeout);

    // Create router
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compression = CompressionLayer::new()
        .gzip(true)
        .br(true)
        .deflate(true)
        .zstd(true);

    let state = AppState::new(assistant).with_max_body_bytes(config.max_body_bytes);
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(compression);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(
        handler_timeout_secs = config.handler_timeout.as_secs(),
        "Property Assist listening on {}",
        addr
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
