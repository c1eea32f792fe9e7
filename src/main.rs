//! Application entry point for the `growtelemetry` service.
//!
//! Startup sequence:
//! - Initializing structured logging/tracing
//! - Loading configuration from environment variables or `.env`
//! - Opening the SQLite pool and creating the schema if it does not exist
//! - Opening the telemetry core (rebuilds chunk catalogue and alert state)
//! - Spawning the maintenance scheduler
//! - Mounting all API routes via the `routes` gateway and serving requests
//!
//! # Environment Variables
//! - `DATABASE_URL` (**required**) – sqlx SQLite URL
//! - `AXUM_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `AXUM_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! See `config.rs` for the rest.
use std::{env, io::IsTerminal, sync::Arc};

use axum::Router;
use dotenvy::dotenv;
use tokio::sync::watch;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use anyhow::{Context, Result};

use growtelemetry::{routes, scheduler, schema, Telemetry};

mod config;

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing();
    dotenv().ok();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    tracing::info!("Opening database");
    let pool = schema::connect(&cfg.db_url, cfg.db_pool_max)
        .await
        .context("Failed to open database")?;
    schema::create_schema(&pool).await?;
    tracing::info!("Database ready");

    let telemetry = Arc::new(Telemetry::open(pool, cfg.telemetry_settings()).await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintenance = scheduler::spawn(&telemetry, cfg.maintenance_settings(), shutdown_rx);

    // Build app from routes gateway (EMBP)
    let app: Router = routes::router(Arc::clone(&telemetry));

    tracing::info!("Listening on {}", cfg.bind_addr);
    let listener = tokio::net::TcpListener::bind(cfg.bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down maintenance tasks");
    let _ = shutdown_tx.send(true);
    for task in maintenance {
        if let Err(e) = task.await {
            tracing::warn!("Maintenance task ended abnormally: {}", e);
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// - Color output: `FORCE_COLOR=1|true|yes` forces it on, `0|false|no` off,
///   otherwise TTY detection decides
/// - Span events: `AXUM_SPAN_EVENTS=full` emits ENTER, EXIT and CLOSE,
///   `enter_exit` emits ENTER and EXIT, anything else CLOSE only
/// - Level: `RUST_LOG` when set, otherwise `AXUM_LOG_LEVEL` (default `debug`)
///
/// Call once at startup before any logging.
fn init_tracing() {
    // ---
    let span_events = match env::var("AXUM_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("AXUM_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
