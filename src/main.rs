//! Ember - A daily-activity streak engine with local and server execution modes.
//!
//! # Overview
//!
//! This binary is the server mode: a multi-tenant HTTP service that records
//! activity events, derives per-user streak state, and exposes the two sweep
//! jobs as endpoints for an external scheduler to trigger.
//!
//! # Configuration
//!
//! - `EMBER_PORT`: listen port (default 3000)
//! - `EMBER_DATABASE_URL`: SQLite connection string (default `sqlite:ember.db?mode=rwc`)
//! - `EMBER_TIMEZONE`: IANA name of the global reference timezone (default `UTC`).
//!   One timezone for all users; every day-boundary decision uses it.

use std::env;
use std::net::SocketAddr;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use ember::api::{AppState, router};
use ember::calendar::ReferenceCalendar;
use ember::service::StreakService;
use ember::storage::Storage;

/// Default port if not specified via environment variable.
const DEFAULT_PORT: u16 = 3000;

/// Default database path if not specified via environment variable.
const DEFAULT_DB_PATH: &str = "sqlite:ember.db?mode=rwc";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing with environment filter
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("ember=info".parse()?))
        .init();

    // Load configuration from environment
    let port: u16 = env::var("EMBER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let db_url = env::var("EMBER_DATABASE_URL").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());

    let timezone = env::var("EMBER_TIMEZONE").unwrap_or_else(|_| "UTC".to_string());
    let tz: chrono_tz::Tz = timezone
        .parse()
        .ok()
        .with_context(|| format!("unknown EMBER_TIMEZONE '{timezone}'"))?;
    let calendar = ReferenceCalendar::new(tz);

    info!(port, db_url = %db_url, timezone = %timezone, "Starting Ember server");

    // Initialize storage and the streak service
    let storage = Storage::new(&db_url).await?;
    info!("Database initialized");

    let service = StreakService::new(storage, calendar);
    let state = AppState { service };

    let app = router(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "Ember is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
