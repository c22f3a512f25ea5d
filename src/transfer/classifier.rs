use std::collections::HashMap;

use serde::Serialize;

use super::attempt::Outcome;
use super::item::{ItemId, TransferItem};

/// Per-item retry counters. Owned by the ledger, never by the item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryState {
    pub expired: u32,
    pub failed: u32,
}

/// Why an item was dropped for good.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "cause", content = "reason", rename_all = "snake_case")]
pub enum AbandonCause {
    Expired,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AbandonedItem {
    pub item: TransferItem,
    pub retries: RetryState,
    pub cause: AbandonCause,
}

/// Result of classifying one round.
#[derive(Debug, Default)]
pub struct Classification {
    pub succeeded: Vec<TransferItem>,
    /// Re-queued expired items first, then re-queued failed items.
    pub next_batch: Vec<TransferItem>,
    pub abandoned: Vec<AbandonedItem>,
}

/// Retry bookkeeping across rounds, keyed by item identity.
#[derive(Debug)]
pub struct RetryLedger {
    max_expire_retries: u32,
    max_fail_retries: u32,
    states: HashMap<ItemId, RetryState>,
}

impl RetryLedger {
    pub fn new(max_expire_retries: u32, max_fail_retries: u32) -> Self {
        Self { max_expire_retries, max_fail_retries, states: HashMap::new() }
    }

    pub fn state(&self, id: &ItemId) -> RetryState {
        self.states.get(id).copied().unwrap_or_default()
    }

    /// Retries still available to the given items across both classes. Every
    /// requeue spends one unit, which bounds the number of rounds.
    pub fn remaining_credit(&self, items: &[TransferItem]) -> u64 {
        items
            .iter()
            .map(|it| {
                let s = self.state(&it.id());
                u64::from(self.max_expire_retries.saturating_sub(s.expired))
                    + u64::from(self.max_fail_retries.saturating_sub(s.failed))
            })
            .sum()
    }

    pub fn classify(&mut self, outcomes: Vec<(TransferItem, Outcome)>) -> Classification {
        let mut out = Classification::default();
        let mut retry_failed = Vec::new();
        for (item, outcome) in outcomes {
            let state = self.states.entry(item.id()).or_default();
            match outcome {
                Outcome::Success { .. } => out.succeeded.push(item),
                Outcome::Expired => {
                    if state.expired < self.max_expire_retries {
                        state.expired += 1;
                        out.next_batch.push(item);
                    } else {
                        tracing::warn!("[classify] abandoning {} after {} expiries", item.id(), state.expired + 1);
                        out.abandoned.push(AbandonedItem {
                            item,
                            retries: *state,
                            cause: AbandonCause::Expired,
                        });
                    }
                }
                Outcome::Failed(err) => {
                    if state.failed < self.max_fail_retries {
                        state.failed += 1;
                        retry_failed.push(item);
                    } else {
                        tracing::warn!("[classify] abandoning {}: {}", item.id(), err);
                        out.abandoned.push(AbandonedItem {
                            item,
                            retries: *state,
                            cause: AbandonCause::Failed(err.to_string()),
                        });
                    }
                }
            }
        }
        out.next_batch.extend(retry_failed);
        out
    }
}
