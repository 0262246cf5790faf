//! Beacon server binary.
//!
//! Runs the hub endpoints, the notification consumers and, on agents, the
//! upstream push consumer and pull job. Shuts down on SIGTERM/SIGINT after
//! the background tasks have stopped.

use beacon_queue::EventQueue;
use beacon_server::{app, background, config, AppState};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// How long background tasks get to stop after the HTTP server has.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("BEACON_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration: the server cannot start without valid config");

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    // The queue owns the pool so every committed queue insert wakes consumers.
    let queue = EventQueue::open(&config.database.path, config.database.runtime_settings())
        .expect("failed to create database pool, check database.path in config");
    let pool = queue.pool().clone();

    {
        let conn = pool
            .get()
            .expect("failed to get database connection for migrations");
        let applied = beacon_db::run_migrations(&conn).expect("failed to run database migrations");
        if applied > 0 {
            tracing::info!(count = applied, "applied database migrations");
        }
    }

    let shutdown = CancellationToken::new();
    let tasks = background::start_background_tasks(&config, queue, None, shutdown.clone());
    tracing::info!(tasks = tasks.len(), "started background tasks");

    if config.hub.enabled {
        tracing::info!(tables = ?config.hub.reference_tables, "hub endpoints enabled");
    }
    let app = app(AppState {
        pool,
        hub: config.hub.clone(),
    });
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, "starting beacon server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address, is another process using this port?");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    shutdown.cancel();
    let stopped = tokio::time::timeout(SHUTDOWN_GRACE, async {
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "background task panicked");
            }
        }
    })
    .await;
    if stopped.is_err() {
        tracing::warn!("background tasks did not stop within the grace period");
    }

    tracing::info!("beacon server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
