use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::classifier::{self, ClassifierParams};
use crate::config::ActivitySettings;
use crate::db::{self, Db};
use crate::error::AppError;
use crate::models::{ActivityRecord, RefreshMeta};

const SECONDS_PER_DAY: i64 = 86_400;

pub fn window_start(now: i64, window_days: u32) -> i64 {
    now - i64::from(window_days) * SECONDS_PER_DAY
}

pub fn params_for(settings: &ActivitySettings, threshold: u128, window_days: u32, now: i64) -> ClassifierParams {
    ClassifierParams {
        threshold,
        window_start: window_start(now, window_days),
        adjacency_window: settings.adjacency_window,
        review_threshold: Some(settings.review_threshold),
    }
}

/// Load the window from storage, then classify it with the connection released
pub async fn classify_window(db: &Db, params: ClassifierParams) -> Result<Vec<ActivityRecord>, AppError> {
    let window_start = params.window_start;
    let snapshot = db.call(move |conn| Ok(db::load_snapshot(conn, window_start)?)).await?;
    let records = task::spawn_blocking(move || classifier::classify(&snapshot, &params)).await?;
    Ok(records)
}

/// Periodic full recomputation of the `recent_activity` table
#[derive(Clone)]
pub struct Refresher {
    db: Db,
    settings: ActivitySettings,
    in_flight: Arc<Mutex<()>>,
}

impl Refresher {
    pub fn new(db: Db, settings: ActivitySettings) -> Self {
        Refresher {
            db,
            settings,
            in_flight: Arc::new(Mutex::new(())),
        }
    }

    /// Recompute and swap in the result set. `Ok(None)` when another refresh
    /// is still running.
    pub async fn refresh_once(&self) -> Result<Option<usize>, AppError> {
        let Ok(_running) = self.in_flight.try_lock() else {
            return Ok(None);
        };

        let now = Utc::now();
        let settings = self.settings.clone();
        let params = params_for(&settings, settings.threshold, settings.window_days, now.timestamp());
        let meta_time = now.to_rfc3339();

        let records = classify_window(&self.db, params).await?;
        let meta = RefreshMeta {
            refreshed_at: meta_time,
            threshold: settings.threshold,
            window_days: settings.window_days,
            record_count: records.len(),
        };

        let count = self
            .db
            .call(move |conn| {
                db::replace_recent_activity(conn, &records, &meta)?;
                Ok(records.len())
            })
            .await?;

        Ok(Some(count))
    }

    pub async fn run(self) -> eyre::Result<()> {
        let period = Duration::from_secs(self.settings.refresh_interval_secs);
        info!("Refresher started, interval = {:?}", period);

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            match self.refresh_once().await {
                Ok(Some(count)) => info!(records = count, "Refreshed recent activity"),
                Ok(None) => warn!("Previous refresh still running, skipping this tick"),
                Err(e) => error!("Refresh failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ActivityMode;
    use crate::db::fixtures::*;
    use crate::models::{ActivityType, CurrentDelegation, TransferEvent, VotingPowerSample};
    use alloy::primitives::Address;
    use rusqlite::Connection;

    fn settings(threshold: u128) -> ActivitySettings {
        ActivitySettings {
            threshold,
            window_days: 30,
            adjacency_window: 3,
            review_threshold: u128::MAX,
            mode: ActivityMode::Materialized,
            refresh_interval_secs: 60,
        }
    }

    fn seeded() -> Connection {
        let conn = memory();
        let d = Address::repeat_byte(0xD);
        let x = Address::repeat_byte(0xE);
        let now = Utc::now().timestamp();
        for (block, log, power) in [(100u64, 5u64, 1000u128), (100, 7, 1500)] {
            insert_sample(&conn, &VotingPowerSample {
                delegate_address: d,
                block_number: block,
                log_index: log,
                block_timestamp: now - 60,
                voting_power: power,
            });
        }
        insert_transfer(&conn, &TransferEvent {
            block_number: 100,
            log_index: 6,
            from_address: x,
            to_address: Address::repeat_byte(0x99),
        });
        insert_delegation_row(&conn, &CurrentDelegation {
            delegator: x,
            delegate: d,
            prior_delegate: None,
            delegator_balance: 500,
            block_delegated: 100,
            delegated_timestamp: now - 60,
        });
        conn
    }

    #[test]
    fn window_start_counts_back_whole_days() {
        assert_eq!(window_start(10 * SECONDS_PER_DAY, 3), 7 * SECONDS_PER_DAY);
    }

    #[tokio::test]
    async fn classify_window_reads_storage() {
        let db = Db::new(seeded());
        let params = params_for(&settings(100), 100, 30, Utc::now().timestamp());
        let records = classify_window(&db, params).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].activity_type, ActivityType::TokensReceived);
        assert_eq!(records[0].amount, 500);
    }

    #[tokio::test]
    async fn storage_stays_usable_while_classifying() {
        let db = Db::new(seeded());
        let params = params_for(&settings(100), 100, 30, Utc::now().timestamp());

        let (records, delegations) = tokio::join!(
            classify_window(&db, params),
            db.call(|conn| Ok(db::current_delegations(conn)?.len())),
        );
        assert_eq!(records.unwrap().len(), 1);
        assert_eq!(delegations.unwrap(), 1);
    }

    #[tokio::test]
    async fn refresh_materializes_records_and_metadata() {
        let db = Db::new(seeded());
        let refresher = Refresher::new(db.clone(), settings(100));

        assert_eq!(refresher.refresh_once().await.unwrap(), Some(1));
        // rerunning over the same data gives the same set
        assert_eq!(refresher.refresh_once().await.unwrap(), Some(1));

        let (meta, rows) = db.call(|conn| Ok(db::load_recent_activity(conn)?)).await.unwrap().unwrap();
        assert_eq!(meta.record_count, 1);
        assert_eq!(meta.threshold, 100);
        assert_eq!(rows[0].1.activity_type, ActivityType::TokensReceived);
        assert_eq!(rows[0].0, 500);
    }

    #[tokio::test]
    async fn overlapping_refresh_is_skipped() {
        let refresher = Refresher::new(Db::new(seeded()), settings(100));
        let _held = refresher.in_flight.lock().await;
        assert_eq!(refresher.refresh_once().await.unwrap(), None);
    }
}
