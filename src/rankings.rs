// src/rankings.rs
use std::collections::{BTreeMap, HashSet};

use alloy::primitives::Address;

use crate::models::{CurrentDelegation, DelegateRank, DelegatorRow, HolderRow, TokenHolder, TopDelegate};
use crate::parser::{address_hex, TOKEN_UNIT};

pub const TOP_DELEGATES_LIMIT: usize = 100;
pub const TOP_HOLDERS_LIMIT: usize = 1000;

struct DelegateTotals {
    delegate: Address,
    voting_power: u128,
    delegations: u32,
    non_zero_delegations: u32,
}

/// Sum delegator balances per delegate, strongest first (ties by address)
fn ranked_totals(delegations: &[CurrentDelegation]) -> Vec<DelegateTotals> {
    let mut grouped: BTreeMap<Address, (u128, HashSet<Address>, HashSet<Address>)> = BTreeMap::new();
    for d in delegations.iter().filter(|d| d.delegate != Address::ZERO) {
        let entry = grouped.entry(d.delegate).or_default();
        entry.0 = entry.0.saturating_add(d.delegator_balance);
        entry.1.insert(d.delegator);
        if d.delegator_balance >= TOKEN_UNIT {
            entry.2.insert(d.delegator);
        }
    }

    let mut totals: Vec<DelegateTotals> = grouped
        .into_iter()
        .map(|(delegate, (voting_power, all, non_zero))| DelegateTotals {
            delegate,
            voting_power,
            delegations: all.len() as u32,
            non_zero_delegations: non_zero.len() as u32,
        })
        .collect();
    totals.sort_by(|a, b| b.voting_power.cmp(&a.voting_power).then(a.delegate.cmp(&b.delegate)));
    totals
}

pub fn top_delegates(delegations: &[CurrentDelegation], limit: usize) -> Vec<TopDelegate> {
    ranked_totals(delegations)
        .into_iter()
        .take(limit)
        .enumerate()
        .map(|(i, t)| TopDelegate {
            rank: i as u32 + 1,
            delegate_address: address_hex(&t.delegate),
            voting_power: t.voting_power.to_string(),
            delegations: t.delegations,
            non_zero_delegations: t.non_zero_delegations,
        })
        .collect()
}

pub fn delegate_rank(delegations: &[CurrentDelegation], delegate: &Address) -> Option<DelegateRank> {
    ranked_totals(delegations)
        .into_iter()
        .enumerate()
        .find(|(_, t)| t.delegate == *delegate)
        .map(|(i, t)| DelegateRank {
            rank: i as u32 + 1,
            delegate: address_hex(&t.delegate),
            total_balance: t.voting_power.to_string(),
        })
}

/// A delegate's delegators, largest balance first
pub fn delegators_of(delegations: &[CurrentDelegation], delegate: &Address) -> Vec<DelegatorRow> {
    let mut matching: Vec<&CurrentDelegation> = delegations
        .iter()
        .filter(|d| d.delegate == *delegate)
        .collect();
    matching.sort_by(|a, b| {
        b.delegator_balance
            .cmp(&a.delegator_balance)
            .then(a.delegator.cmp(&b.delegator))
    });

    matching
        .into_iter()
        .map(|d| DelegatorRow {
            delegator: address_hex(&d.delegator),
            prior_delegate: d.prior_delegate.as_ref().map(address_hex),
            delegator_tokens: d.delegator_balance.to_string(),
            block_delegated: d.block_delegated,
            delegated_timestamp: d.delegated_timestamp,
        })
        .collect()
}

/// Total supply currently delegated to a non-zero delegate
pub fn delegated_token_count(delegations: &[CurrentDelegation]) -> u128 {
    delegations
        .iter()
        .filter(|d| d.delegate != Address::ZERO)
        .fold(0u128, |acc, d| acc.saturating_add(d.delegator_balance))
}

pub fn rank_holders(holders: &[TokenHolder], limit: usize) -> Vec<HolderRow> {
    let mut sorted: Vec<&TokenHolder> = holders.iter().collect();
    sorted.sort_by(|a, b| b.balance.cmp(&a.balance).then(a.address.cmp(&b.address)));

    sorted
        .into_iter()
        .take(limit)
        .enumerate()
        .map(|(i, h)| HolderRow {
            address: address_hex(&h.address),
            balance: h.balance.to_string(),
            rank: i as u32 + 1,
            balance_30d_ago: h.balance_30d_ago.to_string(),
        })
        .collect()
}
