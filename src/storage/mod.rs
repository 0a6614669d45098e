//! Storage persistence layer
//!
//! Responsible for storing and loading items, cursors, transactions and
//! balance snapshots. Two interchangeable backends: flat files and SQLite.
//!
//! The one contract both backends must honour by construction: a page's
//! delta and the cursor advance that follows it become visible together or
//! not at all (`commit_sync_page`).

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::models::{
    AppliedCounts, BalanceSnapshot, CursorUpdate, Item, ItemStatus, SyncCursor, SyncOutcome,
    Transaction, TransactionDelta,
};
use crate::vault::EncryptedBlob;
use crate::Result;

pub mod file;
pub mod merge;
pub mod sqlite;

pub use file::FileStorage;
pub use sqlite::SqliteStorage;

/// Trait for item, cursor, transaction and balance persistence
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn put_item(&self, item: &Item) -> Result<()>;
    async fn get_item(&self, item_id: &str) -> Result<Item>;
    async fn list_items(&self) -> Result<Vec<Item>>;
    async fn set_item_status(&self, item_id: &str, status: ItemStatus) -> Result<()>;
    /// Swap the sealed credential for `replacement` if it still equals
    /// `current`, leaving status and metadata as they are now. Returns
    /// `false` when the item is gone or holds a different credential.
    async fn replace_credential(
        &self,
        item_id: &str,
        current: &EncryptedBlob,
        replacement: &EncryptedBlob,
    ) -> Result<bool>;
    /// Remove the item together with its cursor, transactions and balances.
    async fn delete_item(&self, item_id: &str) -> Result<()>;

    async fn put_cursor(&self, item_id: &str, cursor: &str, outcome: SyncOutcome) -> Result<()>;
    async fn get_cursor(&self, item_id: &str) -> Result<Option<SyncCursor>>;

    /// Apply one delta all-or-nothing. Does not touch the cursor.
    async fn apply_transaction_delta(
        &self,
        item_id: &str,
        delta: &TransactionDelta,
    ) -> Result<AppliedCounts>;

    /// Apply a delta and advance the cursor as a single atomic unit.
    ///
    /// Fails with `CursorConflict` (applying nothing) when the stored cursor
    /// no longer equals `expected_cursor`, and with `ItemNotFound` when the
    /// item was deleted in the meantime.
    async fn commit_sync_page(
        &self,
        item_id: &str,
        expected_cursor: Option<&str>,
        delta: &TransactionDelta,
        update: &CursorUpdate,
    ) -> Result<AppliedCounts>;

    /// Live transactions ordered by posting date, then transaction id.
    async fn get_transactions(
        &self,
        item_id: &str,
        since: Option<NaiveDate>,
    ) -> Result<Vec<Transaction>>;

    /// Single transaction lookup, tombstones included.
    async fn get_transaction(
        &self,
        item_id: &str,
        transaction_id: &str,
    ) -> Result<Option<Transaction>>;

    async fn put_balance_snapshot(&self, snapshot: &BalanceSnapshot) -> Result<()>;
    async fn get_latest_balance_snapshot(
        &self,
        item_id: &str,
        account_id: &str,
    ) -> Result<Option<BalanceSnapshot>>;
    /// Most recently written snapshot of every account of the item, by
    /// account id.
    async fn get_latest_balance_snapshots(&self, item_id: &str) -> Result<Vec<BalanceSnapshot>>;

    /// Release pooled resources at shutdown.
    async fn close(&self) {}
}

/// Per-item writer locks. Items never contend with each other.
#[derive(Default)]
pub struct ItemLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ItemLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Owned guard, so it can travel into a blocking task and outlive a
    /// cancelled caller.
    pub async fn acquire(&self, item_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(item_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Drop the entry for `item_id` unless some task still holds or waits
    /// on its mutex. The count is read under the shard lock `acquire` clones
    /// through, so no new holder can appear in between.
    pub fn release(&self, item_id: &str) {
        self.locks
            .remove_if(item_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Stable ordering used by every listing: posting date, then id.
pub(crate) fn sort_transactions(transactions: &mut [Transaction]) {
    transactions.sort_by(|a, b| {
        a.date
            .cmp(&b.date)
            .then_with(|| a.transaction_id.cmp(&b.transaction_id))
    });
}

/// Cursor record for a page commit, stamped now.
pub(crate) fn cursor_from_update(item_id: &str, update: &CursorUpdate) -> SyncCursor {
    SyncCursor {
        item_id: item_id.to_string(),
        cursor: update.cursor.clone(),
        has_more: update.has_more,
        last_synced_at: chrono::Utc::now(),
        last_outcome: update.outcome,
    }
}
