// src/models.rs
use std::{fmt, str::FromStr};

use alloy::primitives::Address;
use serde::Serialize;

use crate::parser::address_hex;

/// One `delegate_power` row: a delegate's total voting power right after an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VotingPowerSample {
    pub delegate_address: Address,
    pub block_number: u64,
    pub log_index: u64,
    pub block_timestamp: i64,
    pub voting_power: u128, // 18-decimal fixed point
}

/// A `DelegateChanged` log. Zero address means "no delegate".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationChangeEvent {
    pub block_number: u64,
    pub log_index: u64,
    pub block_timestamp: i64,
    pub delegator_address: Address,
    pub from_delegate: Address,
    pub to_delegate: Address,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub block_number: u64,
    pub log_index: u64,
    pub from_address: Address,
    pub to_address: Address,
}

/// Current delegator -> delegate assignment with the delegator's balance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentDelegation {
    pub delegator: Address,
    pub delegate: Address,
    pub prior_delegate: Option<Address>,
    pub delegator_balance: u128,
    pub block_delegated: u64,
    pub delegated_timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenHolder {
    pub address: Address,
    pub balance: u128,
    pub balance_30d_ago: u128,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    SelfDelegationInitiated,
    DelegationInitiated,
    DelegationRemoved,
    DelegationToSelf,
    DelegationChanged,
    TokensReceivedAndDelegated,
    SelfTokensReceived,
    SelfTokensSent,
    TokensReceived,
    TokensSent,
}

impl ActivityType {
    pub const ALL: [ActivityType; 10] = [
        ActivityType::SelfDelegationInitiated,
        ActivityType::DelegationInitiated,
        ActivityType::DelegationRemoved,
        ActivityType::DelegationToSelf,
        ActivityType::DelegationChanged,
        ActivityType::TokensReceivedAndDelegated,
        ActivityType::SelfTokensReceived,
        ActivityType::SelfTokensSent,
        ActivityType::TokensReceived,
        ActivityType::TokensSent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::SelfDelegationInitiated => "self_delegation_initiated",
            ActivityType::DelegationInitiated => "delegation_initiated",
            ActivityType::DelegationRemoved => "delegation_removed",
            ActivityType::DelegationToSelf => "delegation_to_self",
            ActivityType::DelegationChanged => "delegation_changed",
            ActivityType::TokensReceivedAndDelegated => "tokens_received_and_delegated",
            ActivityType::SelfTokensReceived => "self_tokens_received",
            ActivityType::SelfTokensSent => "self_tokens_sent",
            ActivityType::TokensReceived => "tokens_received",
            ActivityType::TokensSent => "tokens_sent",
        }
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActivityType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown activity type: {s}"))
    }
}

/// Who an activity is about: a delegation move, or a single delegate's tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ActivitySubject {
    Delegation {
        from_delegate: Address,
        to_delegate: Address,
    },
    Token {
        delegate_address: Address,
    },
}

/// A classified voting power change
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ActivityRecord {
    pub block_number: u64,
    pub log_index: u64,
    pub block_timestamp: i64,
    pub activity_type: ActivityType,
    pub amount: u128,
    pub subject: ActivitySubject,
    pub delegator_address: Option<Address>,
}

/// Wire form of an `ActivityRecord` (also the `recent_activity` row shape)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityRow {
    pub block_number: u64,
    pub block_timestamp: i64,
    pub activity_type: ActivityType,
    pub delegator_address: Option<String>,
    pub amount: String, // decimal string, exact
    pub from_delegate: Option<String>,
    pub to_delegate: Option<String>,
    pub delegate_address: Option<String>,
}

impl From<&ActivityRecord> for ActivityRow {
    fn from(record: &ActivityRecord) -> Self {
        let (from_delegate, to_delegate, delegate_address) = match record.subject {
            ActivitySubject::Delegation {
                from_delegate,
                to_delegate,
            } => (
                Some(address_hex(&from_delegate)),
                Some(address_hex(&to_delegate)),
                None,
            ),
            ActivitySubject::Token { delegate_address } => {
                (None, None, Some(address_hex(&delegate_address)))
            }
        };

        ActivityRow {
            block_number: record.block_number,
            block_timestamp: record.block_timestamp,
            activity_type: record.activity_type,
            delegator_address: record.delegator_address.as_ref().map(address_hex),
            amount: record.amount.to_string(),
            from_delegate,
            to_delegate,
            delegate_address,
        }
    }
}

/// Metadata for the materialized `recent_activity` set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshMeta {
    pub refreshed_at: String, // RFC3339
    pub threshold: u128,
    pub window_days: u32,
    pub record_count: usize,
}

#[derive(Debug, Serialize)]
pub struct PowerHistoryPoint {
    pub block_timestamp: i64,
    pub block_number: u64,
    pub log_index: u64,
    pub voting_power: String,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct TopDelegate {
    pub rank: u32,
    pub delegate_address: String,
    pub voting_power: String,
    pub delegations: u32,
    pub non_zero_delegations: u32,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct DelegateRank {
    pub rank: u32,
    pub delegate: String,
    pub total_balance: String,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct DelegatorRow {
    pub delegator: String,
    pub prior_delegate: Option<String>,
    pub delegator_tokens: String,
    pub block_delegated: u64,
    pub delegated_timestamp: i64,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct HolderRow {
    pub address: String,
    pub balance: String,
    pub rank: u32,
    pub balance_30d_ago: String,
}

#[derive(Debug, Serialize)]
pub struct DelegatedTokenCount {
    pub delegated_tokens: String,
}

#[derive(Debug, Serialize)]
pub struct UpdatedAt {
    pub block_timestamp: Option<i64>,
    pub refreshed_at: Option<String>,
}

/// Per-voter aggregate of governance votes
#[derive(Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoterSummary {
    pub voter: String,
    pub unique_proposal_count: usize,
    pub latest_timestamp: u64,
}

/// One proposal with its lifecycle flags, from the governor database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalStatus {
    pub proposal_id: String,
    pub proposer: String, // lowercase hex
    pub end_block: u64,
    pub executed: bool,
    pub queued: bool,
    pub canceled: bool,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposerStats {
    pub proposer: String,
    pub proposals_created: usize,
    pub proposals_passed: usize,
    pub proposals_defeated: usize,
    pub live_proposal_ids: Vec<String>,
    pub queued_proposal_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_type_strings_round_trip_and_match_serde() {
        for kind in ActivityType::ALL {
            assert_eq!(kind.as_str().parse::<ActivityType>(), Ok(kind));
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
        assert!("tokens_bought".parse::<ActivityType>().is_err());
    }

    #[test]
    fn token_row_populates_delegate_only() {
        let delegate = Address::repeat_byte(0xAB);
        let record = ActivityRecord {
            block_number: 100,
            log_index: 7,
            block_timestamp: 1_700_000_000,
            activity_type: ActivityType::TokensReceived,
            amount: 500,
            subject: ActivitySubject::Token {
                delegate_address: delegate,
            },
            delegator_address: Some(Address::repeat_byte(0x01)),
        };

        let row = ActivityRow::from(&record);
        assert_eq!(row.delegate_address.as_deref(), Some("0xabababababababababababababababababababab"));
        assert!(row.from_delegate.is_none() && row.to_delegate.is_none());
        assert_eq!(row.amount, "500");

        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["activity_type"], "tokens_received");
        assert_eq!(json["block_number"], 100);
    }
}
