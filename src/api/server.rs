//! Engine bootstrap: wiring, router assembly, and the serve loop.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;

use super::{AppState, SharedState, api_router, ws};
use crate::events::EventBus;
use crate::monitor::{self, Conductor, Guardian, LogChannel, MonitorConfig, WorkerChannel};
use crate::phases::{PhaseProgressionService, PhaseRegistry};
use crate::queue::TaskQueueService;
use crate::resolver::WorkerResolver;
use crate::store::{DbHandle, EngineDb};

/// Configuration for the engine server.
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    /// Optional TOML phase file; the built-in pipeline otherwise.
    pub phases_path: Option<PathBuf>,
    pub monitor: MonitorConfig,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4150,
            db_path: PathBuf::from(".overseer/engine.db"),
            phases_path: None,
            monitor: MonitorConfig::default(),
            dev_mode: false,
        }
    }
}

/// Wire the full service graph over one database and one bus, and
/// register the progression hooks. The returned state drives both the
/// router and the monitor loops.
pub fn build_state(db: EngineDb, registry: PhaseRegistry, bus: Option<Arc<EventBus>>) -> SharedState {
    let db = DbHandle::new(db);
    let bus = bus.unwrap_or_default();
    let registry = Arc::new(registry);

    let queue = Arc::new(TaskQueueService::new(
        db.clone(),
        bus.clone(),
        registry.clone(),
    ));
    let progression = Arc::new(PhaseProgressionService::new(
        db.clone(),
        registry.clone(),
        bus.clone(),
    ));
    progression.register_hooks();
    let resolver = Arc::new(WorkerResolver::new(db.clone()));

    Arc::new(AppState {
        db,
        queue,
        progression,
        resolver,
        registry,
        bus,
    })
}

/// Build the application router: REST API, WebSocket event stream.
pub fn build_router(state: SharedState) -> Router {
    api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Start the engine: store, hooks, monitor loops, HTTP server.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let registry = match &config.phases_path {
        Some(path) => PhaseRegistry::load(path)?,
        None => PhaseRegistry::default_pipeline(),
    };
    let db = EngineDb::new(&config.db_path).context("Failed to initialize engine database")?;
    let state = build_state(db, registry, None);

    let channel: Arc<dyn WorkerChannel> = Arc::new(LogChannel);
    let guardian = Arc::new(Guardian::new(
        state.db.clone(),
        state.queue.clone(),
        state.bus.clone(),
        channel,
        &config.monitor,
    ));
    let conductor = Arc::new(Conductor::new(
        state.db.clone(),
        state.registry.clone(),
        state.bus.clone(),
        &config.monitor,
    ));
    let (_guardian_handle, _conductor_handle) = monitor::spawn(guardian, conductor, &config.monitor);

    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "overseer engine listening");
    println!("Overseer engine running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    println!("Engine shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::error!("Failed to install Ctrl+C handler");
        return;
    }
    println!("\nShutting down...");
}
