use std::sync::{Arc, Mutex};

use alloy::primitives::Address;
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tokio::task;

use crate::classifier::ActivitySnapshot;
use crate::error::AppError;
use crate::models::{
    ActivityRecord, ActivityRow, CurrentDelegation, DelegationChangeEvent, PowerHistoryPoint,
    ProposalStatus, RefreshMeta, TokenHolder, TransferEvent, VotingPowerSample,
};
use crate::parser::{parse_address, parse_amount};

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS delegate_power (
  delegate_address TEXT NOT NULL,
  block_number     INTEGER NOT NULL,
  log_index        INTEGER NOT NULL,
  block_timestamp  INTEGER NOT NULL,
  voting_power     TEXT NOT NULL, -- 18-decimal integer stored as string
  PRIMARY KEY (delegate_address, block_number, log_index)
);
CREATE INDEX IF NOT EXISTS delegate_power_timestamp ON delegate_power (block_timestamp);

CREATE TABLE IF NOT EXISTS delegation_events (
  block_number    INTEGER NOT NULL,
  log_index       INTEGER NOT NULL,
  block_timestamp INTEGER NOT NULL,
  delegator       TEXT NOT NULL,
  from_delegate   TEXT NOT NULL,
  to_delegate     TEXT NOT NULL,
  PRIMARY KEY (block_number, log_index)
);
CREATE INDEX IF NOT EXISTS delegation_events_timestamp ON delegation_events (block_timestamp);

CREATE TABLE IF NOT EXISTS transfer_events (
  block_number INTEGER NOT NULL,
  log_index    INTEGER NOT NULL,
  from_address TEXT NOT NULL,
  to_address   TEXT NOT NULL,
  amount       TEXT NOT NULL,
  PRIMARY KEY (block_number, log_index)
);

CREATE TABLE IF NOT EXISTS current_delegations (
  delegator           TEXT NOT NULL PRIMARY KEY,
  delegate            TEXT NOT NULL,
  prior_delegate      TEXT,
  delegator_balance   TEXT NOT NULL,
  block_delegated     INTEGER NOT NULL,
  delegated_timestamp INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS token_holders (
  address         TEXT NOT NULL PRIMARY KEY,
  balance         TEXT NOT NULL,
  balance_30d_ago TEXT NOT NULL DEFAULT '0'
);

CREATE TABLE IF NOT EXISTS recent_activity (
  position          INTEGER NOT NULL PRIMARY KEY,
  block_number      INTEGER NOT NULL,
  block_timestamp   INTEGER NOT NULL,
  activity_type     TEXT NOT NULL,
  delegator_address TEXT,
  amount            TEXT NOT NULL,
  from_delegate     TEXT,
  to_delegate       TEXT,
  delegate_address  TEXT
);

CREATE TABLE IF NOT EXISTS activity_refresh (
  id           INTEGER NOT NULL PRIMARY KEY CHECK (id = 1),
  refreshed_at TEXT NOT NULL,
  threshold    TEXT NOT NULL,
  window_days  INTEGER NOT NULL,
  record_count INTEGER NOT NULL
);
"#;

/// Connect to SQLite (with WAL mode for performance)
pub fn connect(path: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    Ok(conn)
}

/// Run schema migrations
pub fn run_migrations(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(INIT_SQL)
}

/// Storage handle shared by the API and the refresher.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn new(conn: Connection) -> Self {
        Db {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run blocking storage work off the async runtime.
    pub async fn call<T, F>(&self, f: F) -> Result<T, AppError>
    where
        F: FnOnce(&mut Connection) -> Result<T, AppError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let mut db = conn.lock().map_err(|_| AppError::Poisoned)?;
            f(&mut db)
        })
        .await?
    }
}

// ---------- column helpers ----------

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn address_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Address> {
    let raw: String = row.get(idx)?;
    parse_address(&raw).ok_or_else(|| conversion_error(idx, format!("invalid address: {raw}")))
}

fn opt_address_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Address>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(raw) if !raw.is_empty() => parse_address(&raw)
            .map(Some)
            .ok_or_else(|| conversion_error(idx, format!("invalid address: {raw}"))),
        _ => Ok(None),
    }
}

fn amount_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<u128> {
    let raw: String = row.get(idx)?;
    parse_amount(&raw).ok_or_else(|| conversion_error(idx, format!("invalid amount: {raw}")))
}

// ---------- classifier input ----------

/// Full sample history (the lag needs it) plus the window's events
pub fn load_snapshot(conn: &Connection, window_start: i64) -> rusqlite::Result<ActivitySnapshot> {
    let mut stmt = conn.prepare(
        "SELECT delegate_address, block_number, log_index, block_timestamp, voting_power
         FROM delegate_power
         ORDER BY delegate_address, block_number, log_index",
    )?;
    let samples = stmt
        .query_map([], |r| {
            Ok(VotingPowerSample {
                delegate_address: address_col(r, 0)?,
                block_number: r.get(1)?,
                log_index: r.get(2)?,
                block_timestamp: r.get(3)?,
                voting_power: amount_col(r, 4)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = conn.prepare(
        "SELECT block_number, log_index, block_timestamp, delegator, from_delegate, to_delegate
         FROM delegation_events
         WHERE block_timestamp >= ?1
         ORDER BY block_number, log_index",
    )?;
    let delegation_events = stmt
        .query_map([window_start], |r| {
            Ok(DelegationChangeEvent {
                block_number: r.get(0)?,
                log_index: r.get(1)?,
                block_timestamp: r.get(2)?,
                delegator_address: address_col(r, 3)?,
                from_delegate: address_col(r, 4)?,
                to_delegate: address_col(r, 5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    // transfers carry no timestamp; bound them by the first in-window block
    let mut stmt = conn.prepare(
        "SELECT block_number, log_index, from_address, to_address
         FROM transfer_events
         WHERE block_number >= (
             SELECT COALESCE(MIN(block_number), 9223372036854775807)
             FROM delegate_power WHERE block_timestamp >= ?1
         )
         ORDER BY block_number, log_index",
    )?;
    let transfers = stmt
        .query_map([window_start], |r| {
            Ok(TransferEvent {
                block_number: r.get(0)?,
                log_index: r.get(1)?,
                from_address: address_col(r, 2)?,
                to_address: address_col(r, 3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(ActivitySnapshot {
        samples,
        delegation_events,
        transfers,
        delegations: current_delegations(conn)?,
    })
}

pub fn current_delegations(conn: &Connection) -> rusqlite::Result<Vec<CurrentDelegation>> {
    let mut stmt = conn.prepare(
        "SELECT delegator, delegate, prior_delegate, delegator_balance,
                block_delegated, delegated_timestamp
         FROM current_delegations",
    )?;
    let rows = stmt.query_map([], |r| {
        Ok(CurrentDelegation {
            delegator: address_col(r, 0)?,
            delegate: address_col(r, 1)?,
            prior_delegate: opt_address_col(r, 2)?,
            delegator_balance: amount_col(r, 3)?,
            block_delegated: r.get(4)?,
            delegated_timestamp: r.get(5)?,
        })
    })?;
    rows.collect()
}

pub fn token_holders(conn: &Connection) -> rusqlite::Result<Vec<TokenHolder>> {
    let mut stmt = conn.prepare("SELECT address, balance, balance_30d_ago FROM token_holders")?;
    let rows = stmt.query_map([], |r| {
        Ok(TokenHolder {
            address: address_col(r, 0)?,
            balance: amount_col(r, 1)?,
            balance_30d_ago: amount_col(r, 2)?,
        })
    })?;
    rows.collect()
}

/// A delegate's voting power over time, newest first
pub fn power_history(conn: &Connection, delegate: &str) -> rusqlite::Result<Vec<PowerHistoryPoint>> {
    let mut stmt = conn.prepare(
        "SELECT block_timestamp, block_number, log_index, voting_power
         FROM delegate_power
         WHERE LOWER(delegate_address) = LOWER(?1)
         ORDER BY block_number DESC, log_index DESC",
    )?;
    let rows = stmt.query_map([delegate], |r| {
        Ok(PowerHistoryPoint {
            block_timestamp: r.get(0)?,
            block_number: r.get(1)?,
            log_index: r.get(2)?,
            voting_power: r.get(3)?,
        })
    })?;
    rows.collect()
}

/// Timestamp of the newest indexed block
pub fn latest_block_timestamp(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    conn.query_row(
        "SELECT block_timestamp FROM (
             SELECT block_number, block_timestamp FROM delegate_power
             UNION ALL
             SELECT block_number, block_timestamp FROM delegation_events
         )
         ORDER BY block_number DESC
         LIMIT 1",
        [],
        |r| r.get(0),
    )
    .optional()
}

// ---------- materialized recent activity ----------

/// Swap in a complete result set. Readers see either the old set or the new one.
pub fn replace_recent_activity(
    conn: &mut Connection,
    records: &[ActivityRecord],
    meta: &RefreshMeta,
) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM recent_activity", [])?;
    {
        let mut insert = tx.prepare(
            "INSERT INTO recent_activity (
                 position, block_number, block_timestamp, activity_type,
                 delegator_address, amount, from_delegate, to_delegate, delegate_address
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        for (position, record) in records.iter().enumerate() {
            let row = ActivityRow::from(record);
            insert.execute(params![
                position as i64,
                row.block_number,
                row.block_timestamp,
                row.activity_type.as_str(),
                row.delegator_address,
                row.amount,
                row.from_delegate,
                row.to_delegate,
                row.delegate_address,
            ])?;
        }
    }
    tx.execute(
        "INSERT INTO activity_refresh (id, refreshed_at, threshold, window_days, record_count)
         VALUES (1, ?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET
             refreshed_at = excluded.refreshed_at,
             threshold    = excluded.threshold,
             window_days  = excluded.window_days,
             record_count = excluded.record_count",
        params![
            meta.refreshed_at,
            meta.threshold.to_string(),
            meta.window_days,
            meta.record_count as i64
        ],
    )?;
    tx.commit()
}

pub fn refresh_meta(conn: &Connection) -> rusqlite::Result<Option<RefreshMeta>> {
    conn.query_row(
        "SELECT refreshed_at, threshold, window_days, record_count FROM activity_refresh WHERE id = 1",
        [],
        |r| {
            let record_count: i64 = r.get(3)?;
            Ok(RefreshMeta {
                refreshed_at: r.get(0)?,
                threshold: amount_col(r, 1)?,
                window_days: r.get(2)?,
                record_count: record_count as usize,
            })
        },
    )
    .optional()
}

/// A cached row with its amount already parsed
pub type CachedActivity = (u128, ActivityRow);

/// The materialized set, or `None` before the first refresh
pub fn load_recent_activity(conn: &Connection) -> rusqlite::Result<Option<(RefreshMeta, Vec<CachedActivity>)>> {
    let Some(meta) = refresh_meta(conn)? else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT block_number, block_timestamp, activity_type, delegator_address,
                amount, from_delegate, to_delegate, delegate_address
         FROM recent_activity
         ORDER BY position",
    )?;
    let rows = stmt
        .query_map([], |r| {
            let kind: String = r.get(2)?;
            let amount = amount_col(r, 4)?;
            let row = ActivityRow {
                block_number: r.get(0)?,
                block_timestamp: r.get(1)?,
                activity_type: kind.parse().map_err(|e| conversion_error(2, e))?,
                delegator_address: r.get(3)?,
                amount: amount.to_string(),
                from_delegate: r.get(5)?,
                to_delegate: r.get(6)?,
                delegate_address: r.get(7)?,
            };
            Ok((amount, row))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(Some((meta, rows)))
}

// ---------- governor database ----------

const GOVERNOR_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS proposals (
  proposal_id TEXT NOT NULL PRIMARY KEY,
  proposer    TEXT NOT NULL,
  start_block INTEGER NOT NULL DEFAULT 0,
  end_block   INTEGER NOT NULL,
  description TEXT
);
CREATE INDEX IF NOT EXISTS proposals_proposer ON proposals (proposer);

CREATE TABLE IF NOT EXISTS proposal_lifecycle (
  proposal_id  TEXT NOT NULL,
  event_type   TEXT NOT NULL, -- queued | executed | canceled
  block_number INTEGER NOT NULL,
  PRIMARY KEY (proposal_id, event_type)
);

CREATE TABLE IF NOT EXISTS votes (
  proposal_id  TEXT NOT NULL,
  voter        TEXT NOT NULL,
  support      INTEGER NOT NULL,
  weight       TEXT NOT NULL DEFAULT '0',
  block_number INTEGER NOT NULL,
  PRIMARY KEY (proposal_id, voter)
);
"#;

/// Schema for the governor (proposals and votes) database
pub fn run_governor_migrations(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(GOVERNOR_SQL)
}

/// Newest block seen in the governor's votes, 0 when empty
pub fn current_governor_block(conn: &Connection) -> rusqlite::Result<u64> {
    conn.query_row("SELECT COALESCE(MAX(block_number), 0) FROM votes", [], |r| r.get(0))
}

/// Proposals created by any of `proposers` (lowercase hex), with lifecycle flags
pub fn proposal_statuses(conn: &Connection, proposers: &[String]) -> rusqlite::Result<Vec<ProposalStatus>> {
    if proposers.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = (1..=proposers.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT p.proposal_id, LOWER(p.proposer), p.end_block,
                MAX(l.event_type = 'executed'),
                MAX(l.event_type = 'queued'),
                MAX(l.event_type = 'canceled')
         FROM proposals p
         LEFT JOIN proposal_lifecycle l ON l.proposal_id = p.proposal_id
         WHERE LOWER(p.proposer) IN ({placeholders})
         GROUP BY p.proposal_id
         ORDER BY p.end_block, p.proposal_id"
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(proposers), |r| {
        let flag = |idx: usize| -> rusqlite::Result<bool> { Ok(r.get::<_, Option<i64>>(idx)?.unwrap_or(0) != 0) };
        Ok(ProposalStatus {
            proposal_id: r.get(0)?,
            proposer: r.get(1)?,
            end_block: r.get(2)?,
            executed: flag(3)?,
            queued: flag(4)?,
            canceled: flag(5)?,
        })
    })?;
    rows.collect()
}
