use dotenvy::dotenv;
use eyre::{eyre, Result};
use std::{env, str::FromStr};
use tracing::info;

use crate::parser::parse_threshold;

pub const DEFAULT_GOVERNANCE_URL: &str = "https://ens-governance-indexer-production.up.railway.app/";

/// How `/get-recent-activity` is served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityMode {
    /// Classify on every request
    Live,
    /// Serve a periodically refreshed table
    Materialized,
}

impl FromStr for ActivityMode {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(ActivityMode::Live),
            "materialized" => Ok(ActivityMode::Materialized),
            other => Err(eyre!("ACTIVITY_MODE must be 'live' or 'materialized', got '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActivitySettings {
    pub threshold: u128,
    pub window_days: u32,
    pub adjacency_window: u64,
    pub review_threshold: u128,
    pub mode: ActivityMode,
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub governor_db_path: String,
    pub port: u16,
    pub governance_url: String,
    pub activity: ActivitySettings,
}

pub fn load() -> Result<Config> {
    dotenv().ok();

    let cfg = from_vars(|key| env::var(key).ok())?;
    info!("Loaded config: {:?}", cfg);
    Ok(cfg)
}

fn parsed<T>(var: impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| eyre!("invalid {key} '{raw}': {e}")),
        _ => Ok(default),
    }
}

fn amount(var: impl Fn(&str) -> Option<String>, key: &str, default: u128) -> Result<u128> {
    match var(key) {
        Some(raw) if !raw.trim().is_empty() => parse_threshold(&raw).map_err(|e| eyre!("invalid {key}: {e}")),
        _ => Ok(default),
    }
}

/// Build the config from a variable lookup
pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Config> {
    let db_path = var("DATABASE_URL").unwrap_or_else(|| "ens_delegates.db".to_string());
    let governor_db_path = var("GOVERNOR_DATABASE_URL").unwrap_or_else(|| "ens_governor.db".to_string());
    let port = parsed(&var, "PORT", 8080u16)?;
    let governance_url = var("GOVERNANCE_INDEXER_URL").unwrap_or_else(|| DEFAULT_GOVERNANCE_URL.to_string());

    // 1,000 ENS
    let threshold = amount(&var, "ACTIVITY_THRESHOLD", 1_000_000_000_000_000_000_000)?;
    // 100,000 ENS
    let review_threshold = amount(&var, "REVIEW_THRESHOLD", 100_000_000_000_000_000_000_000)?;

    let window_days = parsed(&var, "ACTIVITY_WINDOW_DAYS", 30u32)?;
    if window_days == 0 {
        return Err(eyre!("ACTIVITY_WINDOW_DAYS must be positive"));
    }
    let refresh_interval_secs = parsed(&var, "REFRESH_INTERVAL_SECS", 300u64)?;
    if refresh_interval_secs == 0 {
        return Err(eyre!("REFRESH_INTERVAL_SECS must be positive"));
    }

    Ok(Config {
        db_path,
        governor_db_path,
        port,
        governance_url,
        activity: ActivitySettings {
            threshold,
            window_days,
            adjacency_window: parsed(&var, "ADJACENCY_WINDOW", 3u64)?,
            review_threshold,
            mode: parsed(&var, "ACTIVITY_MODE", ActivityMode::Live)?,
            refresh_interval_secs,
        },
    })
}
