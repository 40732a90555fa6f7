use axum::{
    extract::{Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use alloy::primitives::Address;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::{ActivityMode, Config};
use crate::db::{self, Db};
use crate::error::AppError;
use crate::governance::{summarize_votes, tally_proposals, GovernanceClient};
use crate::models::{
    ActivityRow, DelegateRank, DelegatedTokenCount, DelegatorRow, HolderRow, PowerHistoryPoint,
    ProposerStats, TopDelegate, UpdatedAt, VoterSummary,
};
use crate::parser::{address_hex, parse_address, parse_threshold};
use crate::rankings;
use crate::refresher::{classify_window, params_for};

const MAX_WINDOW_DAYS: u32 = 3650;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    /// Proposals, lifecycle events and votes
    pub governor: Db,
    pub cfg: Arc<Config>,
    pub governance: GovernanceClient,
}

/// Response envelope shared by every endpoint
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub message: &'static str,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(ApiResponse {
            message: "Data retrieved successfully",
            data,
            updated_at: None,
        })
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, AppError>;

#[derive(Debug, Default, Deserialize)]
pub struct RecentActivityQuery {
    pub threshold: Option<String>,
    pub days: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DelegateQuery {
    pub delegate: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddressesRequest {
    pub addresses: Option<serde_json::Value>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(|| async { "ENS delegate activity API running" }))
        .route("/api/get-recent-activity", get(recent_activity))
        .route("/api/get-updated-at", get(updated_at))
        .route("/api/get-top-delegates", get(top_delegates))
        .route("/api/get-delegate-rank", get(delegate_rank))
        .route("/api/get-delegators", get(delegators))
        .route("/api/get-delegate-power-history", get(power_history))
        .route("/api/get-top-holders", get(top_holders))
        .route("/api/get-delegated-token-count", get(delegated_token_count))
        .route("/api/get-voting-history", post(voting_history))
        .route("/api/get-proposer-stats", post(proposer_stats))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(state: AppState) -> eyre::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], state.cfg.port));
    info!("API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state).into_make_service()).await?;

    Ok(())
}

// ---------- parameter validation ----------

fn required_delegate(q: &DelegateQuery) -> Result<Address, AppError> {
    let raw = q
        .delegate
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest("Delegate parameter is required".into()))?;
    parse_address(raw).ok_or_else(|| AppError::BadRequest(format!("Invalid delegate address: {raw}")))
}

fn window_days(raw: Option<&str>, default: u32) -> Result<u32, AppError> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    match raw.trim().parse::<u32>() {
        Ok(days) if (1..=MAX_WINDOW_DAYS).contains(&days) => Ok(days),
        _ => Err(AppError::BadRequest(format!(
            "days must be an integer between 1 and {MAX_WINDOW_DAYS}: {raw}"
        ))),
    }
}

// ---------- handlers ----------

async fn recent_activity(
    State(state): State<AppState>,
    Query(q): Query<RecentActivityQuery>,
) -> ApiResult<Vec<ActivityRow>> {
    let settings = state.cfg.activity.clone();
    let threshold = match q.threshold.as_deref() {
        Some(raw) => parse_threshold(raw).map_err(AppError::BadRequest)?,
        None => settings.threshold,
    };
    let days = window_days(q.days.as_deref(), settings.window_days)?;

    if settings.mode == ActivityMode::Materialized {
        let cached = state.db.call(|conn| Ok(db::load_recent_activity(conn)?)).await?;
        // a higher threshold is a filter over the cached set
        if let Some((meta, rows)) = cached {
            if meta.window_days == days && threshold >= meta.threshold {
                let rows = rows
                    .into_iter()
                    .filter(|(amount, _)| *amount >= threshold)
                    .map(|(_, row)| row)
                    .collect();
                return Ok(Json(ApiResponse {
                    message: "Data retrieved successfully",
                    data: rows,
                    updated_at: Some(meta.refreshed_at),
                }));
            }
        }
    }

    let params = params_for(&settings, threshold, days, Utc::now().timestamp());
    let records = classify_window(&state.db, params).await?;

    Ok(ApiResponse::ok(records.iter().map(ActivityRow::from).collect()))
}

async fn updated_at(State(state): State<AppState>) -> ApiResult<UpdatedAt> {
    let data = state
        .db
        .call(|conn| {
            Ok(UpdatedAt {
                block_timestamp: db::latest_block_timestamp(conn)?,
                refreshed_at: db::refresh_meta(conn)?.map(|m| m.refreshed_at),
            })
        })
        .await?;
    Ok(ApiResponse::ok(data))
}

async fn top_delegates(State(state): State<AppState>) -> ApiResult<Vec<TopDelegate>> {
    let delegations = state.db.call(|conn| Ok(db::current_delegations(conn)?)).await?;
    Ok(ApiResponse::ok(rankings::top_delegates(
        &delegations,
        rankings::TOP_DELEGATES_LIMIT,
    )))
}

async fn delegate_rank(
    State(state): State<AppState>,
    Query(q): Query<DelegateQuery>,
) -> ApiResult<Vec<DelegateRank>> {
    let delegate = required_delegate(&q)?;
    let delegations = state.db.call(|conn| Ok(db::current_delegations(conn)?)).await?;
    let rank = rankings::delegate_rank(&delegations, &delegate);
    Ok(ApiResponse::ok(rank.into_iter().collect()))
}

async fn delegators(
    State(state): State<AppState>,
    Query(q): Query<DelegateQuery>,
) -> ApiResult<Vec<DelegatorRow>> {
    let delegate = required_delegate(&q)?;
    let delegations = state.db.call(|conn| Ok(db::current_delegations(conn)?)).await?;
    Ok(ApiResponse::ok(rankings::delegators_of(&delegations, &delegate)))
}

async fn power_history(
    State(state): State<AppState>,
    Query(q): Query<DelegateQuery>,
) -> ApiResult<Vec<PowerHistoryPoint>> {
    let delegate = address_hex(&required_delegate(&q)?);
    let history = state
        .db
        .call(move |conn| Ok(db::power_history(conn, &delegate)?))
        .await?;
    Ok(ApiResponse::ok(history))
}

async fn top_holders(State(state): State<AppState>) -> ApiResult<Vec<HolderRow>> {
    let holders = state.db.call(|conn| Ok(db::token_holders(conn)?)).await?;
    Ok(ApiResponse::ok(rankings::rank_holders(&holders, rankings::TOP_HOLDERS_LIMIT)))
}

async fn delegated_token_count(State(state): State<AppState>) -> ApiResult<Vec<DelegatedTokenCount>> {
    let delegations = state.db.call(|conn| Ok(db::current_delegations(conn)?)).await?;
    let total = rankings::delegated_token_count(&delegations);
    Ok(ApiResponse::ok(vec![DelegatedTokenCount {
        delegated_tokens: total.to_string(),
    }]))
}

fn invalid_addresses() -> AppError {
    AppError::BadRequest("Invalid input: addresses must be provided as an array".into())
}

fn address_array(body: &AddressesRequest) -> Result<Vec<Address>, AppError> {
    let list = body
        .addresses
        .as_ref()
        .and_then(|v| v.as_array())
        .ok_or_else(invalid_addresses)?;

    list.iter()
        .map(|v| v.as_str().and_then(parse_address).ok_or_else(invalid_addresses))
        .collect()
}

fn voter_addresses(body: &AddressesRequest) -> Result<Vec<Address>, AppError> {
    let voters = address_array(body)?;
    if voters.is_empty() {
        return Err(invalid_addresses());
    }
    Ok(voters)
}

async fn voting_history(
    State(state): State<AppState>,
    Json(body): Json<AddressesRequest>,
) -> Result<Json<ApiResponse<Vec<VoterSummary>>>, AppError> {
    let voters = voter_addresses(&body)?;
    let votes = state
        .governance
        .fetch_votes(&voters)
        .await
        .map_err(|e| AppError::Upstream(e.to_string()))?;

    Ok(Json(ApiResponse {
        message: "Vote data retrieved successfully",
        data: summarize_votes(&votes),
        updated_at: None,
    }))
}

async fn proposer_stats(
    State(state): State<AppState>,
    Json(body): Json<AddressesRequest>,
) -> Result<Json<ApiResponse<Vec<ProposerStats>>>, AppError> {
    let proposers: Vec<String> = address_array(&body)?.iter().map(address_hex).collect();

    let (statuses, current_block) = state
        .governor
        .call(move |conn| {
            Ok((
                db::proposal_statuses(conn, &proposers)?,
                db::current_governor_block(conn)?,
            ))
        })
        .await?;

    Ok(Json(ApiResponse {
        message: "Proposer stats retrieved successfully",
        data: tally_proposals(&statuses, current_block),
        updated_at: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{from_vars, ActivitySettings};
    use crate::db::fixtures::*;
    use crate::models::{ActivityType, CurrentDelegation, TransferEvent, VotingPowerSample};
    use crate::refresher::Refresher;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use rusqlite::Connection;

    fn addr(b: u8) -> Address {
        Address::repeat_byte(b)
    }

    fn seeded() -> Connection {
        let conn = memory();
        let d = addr(0xD);
        let x = addr(0xE);
        let now = Utc::now().timestamp();
        for (block, log, power) in [(100u64, 5u64, 1000u128), (100, 7, 1500), (120, 2, 5000)] {
            insert_sample(&conn, &VotingPowerSample {
                delegate_address: d,
                block_number: block,
                log_index: log,
                block_timestamp: now - 3600,
                voting_power: power,
            });
        }
        for (block, log) in [(100u64, 6u64), (120, 1)] {
            insert_transfer(&conn, &TransferEvent {
                block_number: block,
                log_index: log,
                from_address: x,
                to_address: addr(0x99),
            });
        }
        insert_delegation_row(&conn, &CurrentDelegation {
            delegator: x,
            delegate: d,
            prior_delegate: None,
            delegator_balance: 7_000_000_000_000_000_000,
            block_delegated: 100,
            delegated_timestamp: now - 3600,
        });
        conn
    }

    fn state_with(conn: Connection, mode: &str) -> AppState {
        let mut cfg = from_vars(|key| match key {
            "ACTIVITY_MODE" => Some(mode.to_string()),
            "ACTIVITY_THRESHOLD" => Some("100".to_string()),
            _ => None,
        })
        .unwrap();
        cfg.governance_url = "http://127.0.0.1:9/".to_string();
        AppState {
            db: Db::new(conn),
            governor: Db::new(governor_memory()),
            governance: GovernanceClient::new(cfg.governance_url.clone()).unwrap(),
            cfg: Arc::new(cfg),
        }
    }

    fn query(threshold: Option<&str>, days: Option<&str>) -> Query<RecentActivityQuery> {
        Query(RecentActivityQuery {
            threshold: threshold.map(str::to_string),
            days: days.map(str::to_string),
        })
    }

    fn status_of(err: AppError) -> StatusCode {
        err.into_response().status()
    }

    #[tokio::test]
    async fn live_recent_activity_classifies_on_request() {
        let state = state_with(seeded(), "live");
        let Json(body) = recent_activity(State(state), query(None, None)).await.unwrap();

        let kinds: Vec<_> = body.data.iter().map(|r| (r.block_number, r.activity_type)).collect();
        assert_eq!(
            kinds,
            vec![(120, ActivityType::TokensReceived), (100, ActivityType::TokensReceived)]
        );
        assert_eq!(body.data[0].amount, "3500");
        assert!(body.updated_at.is_none());
    }

    #[tokio::test]
    async fn threshold_override_filters_live_results() {
        let state = state_with(seeded(), "live");
        let Json(body) = recent_activity(State(state), query(Some("1000"), Some("60")))
            .await
            .unwrap();
        assert_eq!(body.data.len(), 1);
        assert_eq!(body.data[0].block_number, 120);
    }

    #[tokio::test]
    async fn invalid_parameters_are_client_errors() {
        let state = state_with(seeded(), "live");
        let err = recent_activity(State(state.clone()), query(Some("lots"), None))
            .await
            .unwrap_err();
        assert_eq!(status_of(err), StatusCode::BAD_REQUEST);

        let err = recent_activity(State(state.clone()), query(None, Some("0")))
            .await
            .unwrap_err();
        assert_eq!(status_of(err), StatusCode::BAD_REQUEST);

        let err = delegators(State(state.clone()), Query(DelegateQuery::default()))
            .await
            .unwrap_err();
        assert_eq!(status_of(err), StatusCode::BAD_REQUEST);

        let err = power_history(State(state), Query(DelegateQuery { delegate: Some("0x12".into()) }))
            .await
            .unwrap_err();
        assert_eq!(status_of(err), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn materialized_mode_serves_cached_set_with_timestamp() {
        let state = state_with(seeded(), "materialized");
        let settings: ActivitySettings = state.cfg.activity.clone();
        Refresher::new(state.db.clone(), settings).refresh_once().await.unwrap();

        // wipe the source rows: the cached set must still be served
        state
            .db
            .call(|conn| Ok(conn.execute("DELETE FROM delegate_power", [])?))
            .await
            .unwrap();

        let Json(body) = recent_activity(State(state.clone()), query(Some("1000"), None))
            .await
            .unwrap();
        assert_eq!(body.data.len(), 1);
        assert!(body.updated_at.is_some());

        // a lower threshold than the cached one falls back to live computation
        let Json(body) = recent_activity(State(state), query(Some("1"), None)).await.unwrap();
        assert!(body.data.is_empty());
        assert!(body.updated_at.is_none());
    }

    #[tokio::test]
    async fn rankings_endpoints_read_current_delegations() {
        let state = state_with(seeded(), "live");
        let Json(body) = top_delegates(State(state.clone())).await.unwrap();
        assert_eq!(body.data.len(), 1);
        assert_eq!(body.data[0].delegate_address, address_hex(&addr(0xD)));

        let delegate = Some(address_hex(&addr(0xD)).to_uppercase().replacen("0X", "0x", 1));
        let Json(body) = delegate_rank(State(state.clone()), Query(DelegateQuery { delegate: delegate.clone() }))
            .await
            .unwrap();
        assert_eq!(body.data[0].rank, 1);

        let Json(body) = delegators(State(state.clone()), Query(DelegateQuery { delegate: delegate.clone() }))
            .await
            .unwrap();
        assert_eq!(body.data[0].delegator, address_hex(&addr(0xE)));

        let Json(body) = power_history(State(state.clone()), Query(DelegateQuery { delegate }))
            .await
            .unwrap();
        assert_eq!(body.data.len(), 3);

        let Json(body) = delegated_token_count(State(state)).await.unwrap();
        assert_eq!(body.data[0].delegated_tokens, "7000000000000000000");
    }

    #[tokio::test]
    async fn updated_at_reports_latest_block() {
        let state = state_with(seeded(), "live");
        let Json(body) = updated_at(State(state)).await.unwrap();
        assert!(body.data.block_timestamp.is_some());
        assert!(body.data.refreshed_at.is_none());
    }

    #[tokio::test]
    async fn corrupt_cached_amount_is_a_service_error() {
        let state = state_with(seeded(), "materialized");
        Refresher::new(state.db.clone(), state.cfg.activity.clone())
            .refresh_once()
            .await
            .unwrap();
        state
            .db
            .call(|conn| Ok(conn.execute("UPDATE recent_activity SET amount = 'garbage'", [])?))
            .await
            .unwrap();

        let err = recent_activity(State(state), query(None, None)).await.unwrap_err();
        assert_eq!(status_of(err), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn proposer_stats_reads_the_governor_database() {
        let state = state_with(memory(), "live");
        let proposer = address_hex(&addr(0xA1));
        let mixed_case = proposer.to_uppercase().replacen("0X", "0x", 1);
        let stored = mixed_case.clone();
        state
            .governor
            .call(move |conn| {
                insert_proposal(conn, "1", &stored, 50, &["queued", "executed"]);
                insert_proposal(conn, "2", &stored, 60, &[]);
                insert_proposal(conn, "3", &stored, 500, &[]);
                insert_proposal(conn, "4", &stored, 500, &["queued"]);
                insert_vote(conn, "3", "0xfeed", 200);
                Ok(())
            })
            .await
            .unwrap();

        let body = AddressesRequest {
            addresses: Some(serde_json::json!([mixed_case, address_hex(&addr(0xB2))])),
        };
        let Json(resp) = proposer_stats(State(state.clone()), Json(body)).await.unwrap();
        assert_eq!(resp.message, "Proposer stats retrieved successfully");
        assert_eq!(resp.data.len(), 1);

        let stats = &resp.data[0];
        assert_eq!(stats.proposer, proposer);
        assert_eq!(stats.proposals_created, 4);
        assert_eq!(stats.proposals_passed, 1);
        assert_eq!(stats.proposals_defeated, 1);
        assert_eq!(stats.live_proposal_ids, vec!["3".to_string()]);
        assert_eq!(stats.queued_proposal_ids, vec!["4".to_string()]);

        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["proposalsCreated"], 4);
        assert_eq!(json["liveProposalIds"], serde_json::json!(["3"]));

        let empty = AddressesRequest { addresses: Some(serde_json::json!([])) };
        let Json(resp) = proposer_stats(State(state.clone()), Json(empty)).await.unwrap();
        assert!(resp.data.is_empty());

        let not_array = AddressesRequest { addresses: Some(serde_json::json!({"a": 1})) };
        let err = proposer_stats(State(state), Json(not_array)).await.unwrap_err();
        assert_eq!(status_of(err), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn voting_history_requires_address_array() {
        let parse = |v: serde_json::Value| voter_addresses(&AddressesRequest { addresses: Some(v) });
        assert!(voter_addresses(&AddressesRequest { addresses: None }).is_err());
        assert!(parse(serde_json::json!("0xabc")).is_err());
        assert!(parse(serde_json::json!([])).is_err());
        assert!(parse(serde_json::json!(["nope"])).is_err());
        assert_eq!(
            parse(serde_json::json!([address_hex(&addr(1))])).unwrap(),
            vec![addr(1)]
        );
    }
}
