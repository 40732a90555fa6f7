// src/classifier.rs
//! Recent-activity classification.
//!
//! Takes the raw `delegate_power` history plus the delegation and transfer logs
//! of a time window and turns every significant voting power change into one
//! of the ten [`ActivityType`]s. Related logs are correlated purely by their
//! position in the block's log order:
//!
//! * a `DelegateChanged` at `log_index` is paired with the affected delegate's
//!   power change at `log_index + 1`;
//! * any other power change is paired with the nearest `Transfer` in the
//!   `adjacency_window` logs before it that involves one of the delegate's
//!   current delegators.
//!
//! Changes that cannot be paired are dropped, never guessed.

use std::collections::{HashMap, HashSet};

use alloy::primitives::Address;
use tracing::{debug, warn};

use crate::models::{
    ActivityRecord, ActivitySubject, ActivityType, CurrentDelegation, DelegationChangeEvent,
    TransferEvent, VotingPowerSample,
};
use crate::parser::{address_hex, format_token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Gained,
    Lost,
}

/// A sample with its lag-derived change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerChange {
    pub delegate_address: Address,
    pub block_number: u64,
    pub log_index: u64,
    pub block_timestamp: i64,
    pub voting_power: u128,
    pub previous_power: u128,
    /// `|voting_power - previous_power|`
    pub amount: u128,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifierParams {
    /// Minimum absolute change, in base units
    pub threshold: u128,
    /// Unix seconds; samples and delegation events before this are ignored
    pub window_start: i64,
    /// How many logs before a power change are searched for its transfer
    pub adjacency_window: u64,
    /// Unattributed changes at or above this are logged for review
    pub review_threshold: Option<u128>,
}

/// Everything one classification run reads
#[derive(Debug, Clone, Default)]
pub struct ActivitySnapshot {
    /// Full, unwindowed history; the lag needs it
    pub samples: Vec<VotingPowerSample>,
    pub delegation_events: Vec<DelegationChangeEvent>,
    pub transfers: Vec<TransferEvent>,
    pub delegations: Vec<CurrentDelegation>,
}

/// Lag `voting_power` per delegate over `(block_number, log_index)`.
/// The first sample of a delegate has `previous_power = 0`.
pub fn power_changes(samples: &[VotingPowerSample]) -> Vec<PowerChange> {
    let mut ordered: Vec<&VotingPowerSample> = samples.iter().collect();
    ordered.sort_by_key(|s| (s.delegate_address, s.block_number, s.log_index));

    let mut changes = Vec::with_capacity(ordered.len());
    let mut previous: Option<(Address, u128)> = None;

    for sample in ordered {
        let previous_power = match previous {
            Some((delegate, power)) if delegate == sample.delegate_address => power,
            _ => 0,
        };
        let direction = if sample.voting_power >= previous_power {
            Direction::Gained
        } else {
            Direction::Lost
        };

        changes.push(PowerChange {
            delegate_address: sample.delegate_address,
            block_number: sample.block_number,
            log_index: sample.log_index,
            block_timestamp: sample.block_timestamp,
            voting_power: sample.voting_power,
            previous_power,
            amount: sample.voting_power.abs_diff(previous_power),
            direction,
        });
        previous = Some((sample.delegate_address, sample.voting_power));
    }

    changes
}

/// First matching rule wins.
pub fn classify_delegation(event: &DelegationChangeEvent) -> ActivityType {
    let from_zero = event.from_delegate == Address::ZERO;
    let to_self = event.to_delegate == event.delegator_address;

    if from_zero && to_self {
        ActivityType::SelfDelegationInitiated
    } else if from_zero {
        ActivityType::DelegationInitiated
    } else if event.to_delegate == Address::ZERO {
        ActivityType::DelegationRemoved
    } else if to_self {
        ActivityType::DelegationToSelf
    } else {
        ActivityType::DelegationChanged
    }
}

fn token_activity(direction: Direction, self_delegated: bool) -> ActivityType {
    match (self_delegated, direction) {
        (true, Direction::Gained) => ActivityType::SelfTokensReceived,
        (true, Direction::Lost) => ActivityType::SelfTokensSent,
        (false, Direction::Gained) => ActivityType::TokensReceived,
        (false, Direction::Lost) => ActivityType::TokensSent,
    }
}

type SampleKey = (Address, u64, u64);

struct Indexes<'a> {
    /// Qualifying changes by `(delegate, block, log_index)`
    changes: HashMap<SampleKey, &'a PowerChange>,
    /// `(delegate, block, log_index)` of every delegation log touching a delegate
    delegation_touches: HashSet<SampleKey>,
    /// Earliest from-zero delegation log per `(delegator, block)`
    first_delegation: HashMap<(Address, u64), u64>,
    /// Transfers per block, highest log index first
    transfers: HashMap<u64, Vec<&'a TransferEvent>>,
    /// Current delegator -> delegate
    delegate_of: HashMap<Address, Address>,
}

impl<'a> Indexes<'a> {
    fn build(snapshot: &'a ActivitySnapshot, qualifying: &[&'a PowerChange]) -> Self {
        let changes = qualifying
            .iter()
            .map(|c| ((c.delegate_address, c.block_number, c.log_index), *c))
            .collect();

        let mut delegation_touches = HashSet::new();
        let mut first_delegation: HashMap<(Address, u64), u64> = HashMap::new();
        for event in &snapshot.delegation_events {
            for delegate in [event.from_delegate, event.to_delegate] {
                if delegate != Address::ZERO {
                    delegation_touches.insert((delegate, event.block_number, event.log_index));
                }
            }
            if event.from_delegate == Address::ZERO {
                first_delegation
                    .entry((event.delegator_address, event.block_number))
                    .and_modify(|log| *log = (*log).min(event.log_index))
                    .or_insert(event.log_index);
            }
        }

        let mut transfers: HashMap<u64, Vec<&TransferEvent>> = HashMap::new();
        for transfer in &snapshot.transfers {
            transfers.entry(transfer.block_number).or_default().push(transfer);
        }
        for block in transfers.values_mut() {
            block.sort_by(|a, b| b.log_index.cmp(&a.log_index));
        }

        let delegate_of = snapshot
            .delegations
            .iter()
            .map(|d| (d.delegator, d.delegate))
            .collect();

        Indexes {
            changes,
            delegation_touches,
            first_delegation,
            transfers,
            delegate_of,
        }
    }

    fn follows_delegation(&self, change: &PowerChange) -> bool {
        change.log_index > 0
            && self.delegation_touches.contains(&(
                change.delegate_address,
                change.block_number,
                change.log_index - 1,
            ))
    }

    /// Nearest transfer in the lookback window that moves tokens of one of
    /// the delegate's delegators; returns that delegator.
    fn find_delegator(&self, change: &PowerChange, adjacency_window: u64) -> Option<Address> {
        let lowest = change.log_index.saturating_sub(adjacency_window);
        let block = self.transfers.get(&change.block_number)?;

        block
            .iter()
            .filter(|t| t.log_index < change.log_index && t.log_index >= lowest)
            .find_map(|t| {
                let sides = match change.direction {
                    Direction::Gained => [t.to_address, t.from_address],
                    Direction::Lost => [t.from_address, t.to_address],
                };
                sides.into_iter().find(|addr| {
                    *addr != Address::ZERO
                        && self.delegate_of.get(addr) == Some(&change.delegate_address)
                })
            })
    }

    fn delegated_earlier(&self, delegator: Address, change: &PowerChange) -> bool {
        self.first_delegation
            .get(&(delegator, change.block_number))
            .is_some_and(|log| *log < change.log_index)
    }
}

/// Classify the snapshot's window. Output is sorted newest first by
/// `(block_number, log_index)` and is identical for identical input.
pub fn classify(snapshot: &ActivitySnapshot, params: &ClassifierParams) -> Vec<ActivityRecord> {
    let changes = power_changes(&snapshot.samples);
    let qualifying: Vec<&PowerChange> = changes
        .iter()
        .filter(|c| {
            c.block_timestamp >= params.window_start
                && c.amount > 0
                && c.amount >= params.threshold
        })
        .collect();

    let idx = Indexes::build(snapshot, &qualifying);
    let mut records = Vec::new();

    for event in &snapshot.delegation_events {
        if event.block_timestamp < params.window_start {
            continue;
        }
        let affected = if event.to_delegate == Address::ZERO {
            event.from_delegate
        } else {
            event.to_delegate
        };

        let Some(change) = idx
            .changes
            .get(&(affected, event.block_number, event.log_index + 1))
        else {
            debug!(
                block = event.block_number,
                log_index = event.log_index,
                delegator = %address_hex(&event.delegator_address),
                "delegation change without adjacent power change, dropped"
            );
            continue;
        };

        records.push(ActivityRecord {
            block_number: event.block_number,
            log_index: event.log_index,
            block_timestamp: event.block_timestamp,
            activity_type: classify_delegation(event),
            amount: change.amount,
            subject: ActivitySubject::Delegation {
                from_delegate: event.from_delegate,
                to_delegate: event.to_delegate,
            },
            delegator_address: Some(event.delegator_address),
        });
    }

    let mut unattributed = 0usize;
    for change in &qualifying {
        if idx.follows_delegation(change) {
            continue;
        }

        let Some(delegator) = idx.find_delegator(change, params.adjacency_window) else {
            unattributed += 1;
            if params.review_threshold.is_some_and(|t| change.amount >= t) {
                warn!(
                    delegate = %address_hex(&change.delegate_address),
                    block = change.block_number,
                    log_index = change.log_index,
                    amount = %format_token(change.amount),
                    "unattributed voting power change"
                );
            }
            continue;
        };

        let activity_type = if idx.delegated_earlier(delegator, change) {
            ActivityType::TokensReceivedAndDelegated
        } else {
            token_activity(change.direction, delegator == change.delegate_address)
        };

        records.push(ActivityRecord {
            block_number: change.block_number,
            log_index: change.log_index,
            block_timestamp: change.block_timestamp,
            activity_type,
            amount: change.amount,
            subject: ActivitySubject::Token {
                delegate_address: change.delegate_address,
            },
            delegator_address: Some(delegator),
        });
    }

    records.sort_by(|a, b| {
        (b.block_number, b.log_index)
            .cmp(&(a.block_number, a.log_index))
            .then_with(|| a.cmp(b))
    });

    debug!(
        qualifying = qualifying.len(),
        classified = records.len(),
        unattributed,
        "classified recent activity"
    );

    records
}
