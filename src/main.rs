mod api;
mod classifier;
mod config;
mod db;
mod error;
mod governance;
mod models;
mod parser;
mod rankings;
mod refresher;

use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::ActivityMode;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stdout)
        .with_target(false)
        .init();

    info!("ENS delegate activity service starting...");

    let cfg = config::load()?;
    info!("  DB Path: {}", cfg.db_path);
    info!("  Port: {}", cfg.port);
    info!("  Activity mode: {:?}", cfg.activity.mode);
    info!("  Threshold: {} ({} days)", cfg.activity.threshold, cfg.activity.window_days);

    let conn = db::connect(&cfg.db_path)?;
    db::run_migrations(&conn)?;
    let db = db::Db::new(conn);

    info!("  Governor DB Path: {}", cfg.governor_db_path);
    let governor_conn = db::connect(&cfg.governor_db_path)?;
    db::run_governor_migrations(&governor_conn)?;

    let state = api::AppState {
        db: db.clone(),
        governor: db::Db::new(governor_conn),
        governance: governance::GovernanceClient::new(cfg.governance_url.clone())?,
        cfg: Arc::new(cfg.clone()),
    };

    let api_handle = tokio::spawn(api::serve(state));

    let refresher_handle = tokio::spawn({
        let refresher = refresher::Refresher::new(db, cfg.activity.clone());
        let mode = cfg.activity.mode;
        async move {
            match mode {
                ActivityMode::Materialized => refresher.run().await,
                // nothing to refresh; park so the select below ignores this arm
                ActivityMode::Live => std::future::pending().await,
            }
        }
    });

    // Graceful shutdown
    tokio::select! {
        res = api_handle => match res {
            Ok(Ok(_)) => info!("API exited cleanly"),
            Ok(Err(e)) => error!("API error: {:?}", e),
            Err(e) => error!("API task panicked: {:?}", e),
        },
        res = refresher_handle => match res {
            Ok(Ok(_)) => info!("Refresher exited cleanly"),
            Ok(Err(e)) => error!("Refresher error: {:?}", e),
            Err(e) => error!("Refresher task panicked: {:?}", e),
        },
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received, stopping...");
        }
    }

    info!("ENS delegate activity service stopped.");
    Ok(())
}
