//! Delta merge rules shared by every backend
//!
//! Backends only differ in how they look up the current state of an id and
//! how they persist the resulting operations.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::models::{AppliedCounts, Transaction, TransactionDelta};

/// What a backend knows about an already stored transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredState {
    pub removed: bool,
    pub last_modified: DateTime<Utc>,
}

impl From<&Transaction> for StoredState {
    fn from(txn: &Transaction) -> Self {
        Self {
            removed: txn.removed,
            last_modified: txn.last_modified,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOp {
    Upsert(Transaction),
    Tombstone {
        transaction_id: String,
        removed_at: DateTime<Utc>,
    },
}

#[derive(Clone, Copy)]
enum Source {
    Added,
    Modified,
}

/// Turn a delta into storage operations plus the counts they represent.
///
/// Rules:
/// - unknown id → insert
/// - live id → replace unless the incoming record is strictly older
/// - tombstoned id → never resurrected
/// - removed id → tombstone if live, stub tombstone if unknown, skipped if
///   already tombstoned
pub fn plan_delta<F>(
    delta: &TransactionDelta,
    removed_at: DateTime<Utc>,
    mut lookup: F,
) -> (Vec<MergeOp>, AppliedCounts)
where
    F: FnMut(&str) -> Option<StoredState>,
{
    let mut ops = Vec::with_capacity(delta.added.len() + delta.modified.len() + delta.removed.len());
    let mut counts = AppliedCounts::default();
    // States produced earlier in this same delta win over storage.
    let mut overlay: HashMap<String, StoredState> = HashMap::new();

    let upserts = delta
        .added
        .iter()
        .map(|t| (Source::Added, t))
        .chain(delta.modified.iter().map(|t| (Source::Modified, t)));

    for (source, incoming) in upserts {
        let id = incoming.transaction_id.as_str();
        let current = overlay.get(id).copied().or_else(|| lookup(id));

        let accept = match current {
            None => true,
            Some(state) if state.removed => false,
            Some(state) => incoming.last_modified >= state.last_modified,
        };

        if !accept {
            counts.skipped += 1;
            continue;
        }

        let mut record = incoming.clone();
        record.removed = false;
        record.removed_at = None;

        overlay.insert(id.to_string(), StoredState::from(&record));
        ops.push(MergeOp::Upsert(record));

        match source {
            Source::Added => counts.added += 1,
            Source::Modified => counts.modified += 1,
        }
    }

    for id in &delta.removed {
        let current = overlay.get(id.as_str()).copied().or_else(|| lookup(id));

        match current {
            Some(state) if !state.removed => {
                overlay.insert(
                    id.clone(),
                    StoredState {
                        removed: true,
                        last_modified: state.last_modified,
                    },
                );
                ops.push(MergeOp::Tombstone {
                    transaction_id: id.clone(),
                    removed_at,
                });
                counts.removed += 1;
            }
            Some(_) => counts.skipped += 1,
            None => {
                let stub = tombstone_stub(id, removed_at);
                overlay.insert(id.clone(), StoredState::from(&stub));
                ops.push(MergeOp::Upsert(stub));
                counts.removed += 1;
            }
        }
    }

    (ops, counts)
}

/// Placeholder for an id removed before it was ever seen, so a late `added`
/// for it is still refused.
fn tombstone_stub(transaction_id: &str, removed_at: DateTime<Utc>) -> Transaction {
    Transaction {
        transaction_id: transaction_id.to_string(),
        account_id: String::new(),
        amount: Decimal::ZERO,
        iso_currency_code: String::new(),
        date: removed_at.date_naive(),
        merchant_name: None,
        category: None,
        pending: false,
        removed: true,
        removed_at: Some(removed_at),
        last_modified: removed_at,
    }
}

/// Apply planned operations to an in-memory transaction map.
pub fn apply_ops(transactions: &mut HashMap<String, Transaction>, ops: &[MergeOp]) {
    for op in ops {
        match op {
            MergeOp::Upsert(txn) => {
                transactions.insert(txn.transaction_id.clone(), txn.clone());
            }
            MergeOp::Tombstone {
                transaction_id,
                removed_at,
            } => {
                if let Some(txn) = transactions.get_mut(transaction_id) {
                    txn.removed = true;
                    txn.removed_at = Some(*removed_at);
                }
            }
        }
    }
}
