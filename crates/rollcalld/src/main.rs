use anyhow::{Context, Result};
use rollcall_store::SqliteStore;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod detector;
mod engine;
mod manager;
mod session;

use config::Config;
use dbus_interface::{ScannerService, BUS_NAME, OBJECT_PATH};
use detector::ReplaySource;
use manager::SessionManager;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load()?;
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating data dir {}", parent.display()))?;
    }
    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("opening database {}", config.db_path.display()))?;
    tracing::info!(path = %config.db_path.display(), "database opened");

    let engine = engine::spawn_engine(store, config.match_policy(), config.eligibility_policy())?;

    let (events_tx, _) = broadcast::channel(256);
    let sessions = Arc::new(SessionManager::new(
        engine,
        ReplaySource::new(config.feature_source.clone()),
        config.session_settings(),
        events_tx,
    ));

    let conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, ScannerService::new(sessions.clone()))?
        .build()
        .await
        .context("registering D-Bus service")?;

    let relay_rx = sessions.subscribe();
    let relay_conn = conn.clone();
    tokio::spawn(async move {
        if let Err(err) = dbus_interface::forward_events(relay_conn, relay_rx).await {
            tracing::error!(error = %err, "D-Bus signal relay stopped");
        }
    });

    if config.autostart {
        match sessions.start().await {
            Ok(id) => tracing::info!(session = %id, "scanning session autostarted"),
            Err(err) => tracing::warn!(error = %err, "autostart failed; waiting for StartSession"),
        }
    }

    tracing::info!("rollcalld ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");
    sessions.stop().await;

    Ok(())
}
