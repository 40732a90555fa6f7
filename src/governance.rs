// src/governance.rs
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use alloy::primitives::Address;
use eyre::{eyre, Result};
use reqwest::Client;
use serde::{Deserialize, Deserializer};
use serde_json::json;
use tracing::info;

use crate::models::{ProposalStatus, ProposerStats, VoterSummary};
use crate::parser::address_hex;

/// Votes returned per query by the governance indexer
pub const VOTES_LIMIT: usize = 1000;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub proposal_id: String,
    pub voter: String,
    #[serde(deserialize_with = "lenient_u64")]
    pub timestamp: u64,
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    data: Option<VotesData>,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct VotesData {
    votes: VoteItems,
}

#[derive(Debug, Deserialize)]
struct VoteItems {
    items: Vec<Vote>,
}

/// GraphQL BigInts arrive as strings or numbers
fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp {n}"))),
        serde_json::Value::String(s) => s.parse().map_err(serde::de::Error::custom),
        other => Err(serde::de::Error::custom(format!("invalid timestamp {other}"))),
    }
}

/// Client for the governance (votes) indexer
#[derive(Clone)]
pub struct GovernanceClient {
    http: Client,
    url: String,
}

impl GovernanceClient {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let http = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(GovernanceClient {
            http,
            url: url.into(),
        })
    }

    /// Fetch votes cast by any of `voters`
    pub async fn fetch_votes(&self, voters: &[Address]) -> Result<Vec<Vote>> {
        let payload = json!({ "query": votes_query(voters) });

        info!("Sending votes query -> {} ({} voters)", self.url, voters.len());

        let resp = self.http.post(&self.url).json(&payload).send().await?;
        if !resp.status().is_success() {
            return Err(eyre!("governance indexer error: HTTP {}", resp.status()));
        }

        let parsed: GraphqlResponse = resp.json().await?;
        if !parsed.errors.is_empty() {
            return Err(eyre!("governance indexer returned errors: {:?}", parsed.errors));
        }
        parsed
            .data
            .map(|d| d.votes.items)
            .ok_or_else(|| eyre!("governance indexer returned no data"))
    }
}

fn votes_query(voters: &[Address]) -> String {
    let list: Vec<String> = voters.iter().map(address_hex).collect();
    let list = serde_json::to_string(&list).unwrap_or_else(|_| "[]".to_string());
    format!(
        "{{ votes(where: {{ voter_in: {list} }} limit: {VOTES_LIMIT}) {{ items {{ id proposalId support reason voter weight timestamp }} }} }}"
    )
}

/// Distinct proposals and latest vote per voter, ordered by voter
pub fn summarize_votes(votes: &[Vote]) -> Vec<VoterSummary> {
    let mut by_voter: BTreeMap<String, (HashSet<&str>, u64)> = BTreeMap::new();
    for vote in votes {
        let entry = by_voter
            .entry(vote.voter.to_ascii_lowercase())
            .or_insert_with(|| (HashSet::new(), vote.timestamp));
        entry.0.insert(vote.proposal_id.as_str());
        entry.1 = entry.1.max(vote.timestamp);
    }

    by_voter
        .into_iter()
        .map(|(voter, (proposals, latest))| VoterSummary {
            voter,
            unique_proposal_count: proposals.len(),
            latest_timestamp: latest,
        })
        .collect()
}

/// Per-proposer proposal counts. A proposal that is neither executed nor
/// canceled is defeated once `end_block` is behind `current_block`, live
/// otherwise (unless queued).
pub fn tally_proposals(statuses: &[ProposalStatus], current_block: u64) -> Vec<ProposerStats> {
    let mut by_proposer: BTreeMap<&str, ProposerStats> = BTreeMap::new();
    for p in statuses {
        let stats = by_proposer.entry(p.proposer.as_str()).or_insert_with(|| ProposerStats {
            proposer: p.proposer.clone(),
            proposals_created: 0,
            proposals_passed: 0,
            proposals_defeated: 0,
            live_proposal_ids: Vec::new(),
            queued_proposal_ids: Vec::new(),
        });

        stats.proposals_created += 1;
        if p.executed {
            stats.proposals_passed += 1;
            continue;
        }
        if p.queued {
            stats.queued_proposal_ids.push(p.proposal_id.clone());
        }
        if p.canceled {
            continue;
        }
        if p.end_block < current_block {
            stats.proposals_defeated += 1;
        } else if !p.queued {
            stats.live_proposal_ids.push(p.proposal_id.clone());
        }
    }

    by_proposer.into_values().collect()
}
