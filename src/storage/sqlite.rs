//! Relational storage backend (SQLite via sqlx)
//!
//! Four tables: `items` (credentials), `transactions`, `balances`, `cursors`.
//! `commit_sync_page` is one database transaction; dropping the future
//! mid-way rolls it back.
//!
//! Reads go through a small pool; every write goes through a one-connection
//! writer pool, so write transactions never race each other for the
//! database lock (SQLite allows one writer at a time).

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, Sqlite, Transaction as DbTransaction};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::merge::{plan_delta, MergeOp, StoredState};
use super::{cursor_from_update, ItemLocks, StorageBackend};
use crate::error::EngineError;
use crate::models::{
    AccountBalance, AppliedCounts, BalanceSnapshot, CursorUpdate, Item, ItemStatus, SyncCursor,
    SyncOutcome, Transaction, TransactionDelta,
};
use crate::vault::EncryptedBlob;
use crate::Result;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS items (
      item_id TEXT PRIMARY KEY,
      credential TEXT NOT NULL,
      status TEXT NOT NULL,
      institution_name TEXT,
      created_at TEXT NOT NULL,
      updated_at TEXT NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cursors (
      item_id TEXT PRIMARY KEY,
      cursor TEXT NOT NULL,
      has_more BOOLEAN NOT NULL,
      last_synced_at TEXT NOT NULL,
      last_outcome TEXT NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transactions (
      item_id TEXT NOT NULL,
      transaction_id TEXT NOT NULL,
      account_id TEXT NOT NULL,
      amount TEXT NOT NULL,
      iso_currency_code TEXT NOT NULL,
      posted_on TEXT NOT NULL,
      merchant_name TEXT,
      category TEXT,
      pending BOOLEAN NOT NULL,
      removed BOOLEAN NOT NULL DEFAULT FALSE,
      removed_at TEXT,
      last_modified TEXT NOT NULL,
      PRIMARY KEY (item_id, transaction_id)
    );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_transactions_item_posted
    ON transactions (item_id, posted_on, transaction_id);
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS balances (
      snapshot_id INTEGER PRIMARY KEY AUTOINCREMENT,
      item_id TEXT NOT NULL,
      account_id TEXT NOT NULL,
      name TEXT,
      mask TEXT,
      account_type TEXT,
      available TEXT,
      current TEXT,
      iso_currency_code TEXT NOT NULL,
      captured_at TEXT NOT NULL
    );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_balances_item_account
    ON balances (item_id, account_id, snapshot_id);
    "#,
];

/// SQLite-backed storage
pub struct SqliteStorage {
    pool: SqlitePool,
    writer: SqlitePool,
    locks: ItemLocks,
}

impl SqliteStorage {
    /// Open (creating if needed) the database at `url` and apply the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let in_memory = url.contains(":memory:");
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let options = if in_memory {
            options
        } else {
            options.journal_mode(SqliteJournalMode::Wal)
        };

        // Every connection to `:memory:` is its own database, so keep one
        // connection alive for the whole process and use it for everything.
        let (pool, writer) = if in_memory {
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?;
            (pool.clone(), pool)
        } else {
            let writer = SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(options.clone())
                .await?;
            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?;
            (pool, writer)
        };

        let storage = Self {
            pool,
            writer,
            locks: ItemLocks::new(),
        };
        storage.ensure_schema().await?;

        info!(in_memory, "SQLite storage initialized");
        Ok(storage)
    }

    async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.writer)
                .await
                .map_err(|e| {
                    EngineError::Storage(format!("Failed to initialize storage schema: {}", e))
                })?;
        }
        Ok(())
    }

    async fn ensure_item(tx: &mut DbTransaction<'_, Sqlite>, item_id: &str) -> Result<()> {
        let row = sqlx::query("SELECT 1 FROM items WHERE item_id = ?")
            .bind(item_id)
            .fetch_optional(&mut **tx)
            .await?;
        match row {
            Some(_) => Ok(()),
            None => Err(EngineError::ItemNotFound(item_id.to_string())),
        }
    }

    async fn stored_cursor(
        tx: &mut DbTransaction<'_, Sqlite>,
        item_id: &str,
    ) -> Result<Option<String>> {
        let row = sqlx::query("SELECT cursor FROM cursors WHERE item_id = ?")
            .bind(item_id)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("cursor")?),
            None => None,
        })
    }

    /// Plan and write a delta inside an open database transaction.
    async fn apply_delta_in(
        tx: &mut DbTransaction<'_, Sqlite>,
        item_id: &str,
        delta: &TransactionDelta,
    ) -> Result<AppliedCounts> {
        let mut known: HashMap<String, StoredState> = HashMap::new();
        let ids = delta
            .added
            .iter()
            .chain(delta.modified.iter())
            .map(|t| t.transaction_id.as_str())
            .chain(delta.removed.iter().map(String::as_str));

        for id in ids {
            if known.contains_key(id) {
                continue;
            }
            let row = sqlx::query(
                "SELECT removed, last_modified FROM transactions WHERE item_id = ? AND transaction_id = ?",
            )
            .bind(item_id)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;

            if let Some(row) = row {
                known.insert(
                    id.to_string(),
                    StoredState {
                        removed: row.try_get("removed")?,
                        last_modified: row.try_get("last_modified")?,
                    },
                );
            }
        }

        let (ops, counts) = plan_delta(delta, Utc::now(), |id| known.get(id).copied());

        for op in &ops {
            match op {
                MergeOp::Upsert(txn) => {
                    sqlx::query(
                        r#"
                        INSERT INTO transactions (
                          item_id, transaction_id, account_id, amount, iso_currency_code,
                          posted_on, merchant_name, category, pending, removed, removed_at,
                          last_modified
                        )
                        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                        ON CONFLICT (item_id, transaction_id) DO UPDATE SET
                          account_id = excluded.account_id,
                          amount = excluded.amount,
                          iso_currency_code = excluded.iso_currency_code,
                          posted_on = excluded.posted_on,
                          merchant_name = excluded.merchant_name,
                          category = excluded.category,
                          pending = excluded.pending,
                          removed = excluded.removed,
                          removed_at = excluded.removed_at,
                          last_modified = excluded.last_modified
                        "#,
                    )
                    .bind(item_id)
                    .bind(&txn.transaction_id)
                    .bind(&txn.account_id)
                    .bind(txn.amount.to_string())
                    .bind(&txn.iso_currency_code)
                    .bind(txn.date)
                    .bind(&txn.merchant_name)
                    .bind(&txn.category)
                    .bind(txn.pending)
                    .bind(txn.removed)
                    .bind(txn.removed_at)
                    .bind(txn.last_modified)
                    .execute(&mut **tx)
                    .await?;
                }
                MergeOp::Tombstone {
                    transaction_id,
                    removed_at,
                } => {
                    sqlx::query(
                        "UPDATE transactions SET removed = TRUE, removed_at = ? WHERE item_id = ? AND transaction_id = ?",
                    )
                    .bind(*removed_at)
                    .bind(item_id)
                    .bind(transaction_id)
                    .execute(&mut **tx)
                    .await?;
                }
            }
        }

        Ok(counts)
    }

    async fn upsert_cursor(
        tx: &mut DbTransaction<'_, Sqlite>,
        cursor: &SyncCursor,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cursors (item_id, cursor, has_more, last_synced_at, last_outcome)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (item_id) DO UPDATE SET
              cursor = excluded.cursor,
              has_more = excluded.has_more,
              last_synced_at = excluded.last_synced_at,
              last_outcome = excluded.last_outcome
            "#,
        )
        .bind(&cursor.item_id)
        .bind(&cursor.cursor)
        .bind(cursor.has_more)
        .bind(cursor.last_synced_at)
        .bind(cursor.last_outcome.to_string())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

//
// ================= Row mapping =================
//

fn decimal_column(row: &SqliteRow, column: &str) -> Result<Option<Decimal>> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|s| {
        Decimal::from_str(&s)
            .map_err(|e| EngineError::Storage(format!("bad decimal in {}: {}", column, e)))
    })
    .transpose()
}

fn item_from_row(row: &SqliteRow) -> Result<Item> {
    let credential: String = row.try_get("credential")?;
    let status: String = row.try_get("status")?;
    Ok(Item {
        item_id: row.try_get("item_id")?,
        credential: serde_json::from_str(&credential)?,
        status: status.parse()?,
        institution_name: row.try_get("institution_name")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn transaction_from_row(row: &SqliteRow) -> Result<Transaction> {
    Ok(Transaction {
        transaction_id: row.try_get("transaction_id")?,
        account_id: row.try_get("account_id")?,
        amount: decimal_column(row, "amount")?
            .ok_or_else(|| EngineError::Storage("transaction without amount".to_string()))?,
        iso_currency_code: row.try_get("iso_currency_code")?,
        date: row.try_get("posted_on")?,
        merchant_name: row.try_get("merchant_name")?,
        category: row.try_get("category")?,
        pending: row.try_get("pending")?,
        removed: row.try_get("removed")?,
        removed_at: row.try_get::<Option<DateTime<Utc>>, _>("removed_at")?,
        last_modified: row.try_get("last_modified")?,
    })
}

fn snapshot_from_row(row: &SqliteRow) -> Result<BalanceSnapshot> {
    Ok(BalanceSnapshot {
        item_id: row.try_get("item_id")?,
        balance: AccountBalance {
            account_id: row.try_get("account_id")?,
            name: row.try_get("name")?,
            mask: row.try_get("mask")?,
            account_type: row.try_get("account_type")?,
            available: decimal_column(row, "available")?,
            current: decimal_column(row, "current")?,
            iso_currency_code: row.try_get("iso_currency_code")?,
        },
        captured_at: row.try_get("captured_at")?,
    })
}

const TRANSACTION_COLUMNS: &str = "transaction_id, account_id, amount, iso_currency_code, posted_on, \
     merchant_name, category, pending, removed, removed_at, last_modified";

const BALANCE_COLUMNS: &str = "item_id, account_id, name, mask, account_type, available, current, \
     iso_currency_code, captured_at";

#[async_trait]
impl StorageBackend for SqliteStorage {
    async fn put_item(&self, item: &Item) -> Result<()> {
        let credential = serde_json::to_string(&item.credential)?;
        sqlx::query(
            r#"
            INSERT INTO items (item_id, credential, status, institution_name, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (item_id) DO UPDATE SET
              credential = excluded.credential,
              status = excluded.status,
              institution_name = excluded.institution_name,
              updated_at = excluded.updated_at
            "#,
        )
        .bind(&item.item_id)
        .bind(credential)
        .bind(item.status.to_string())
        .bind(&item.institution_name)
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&self.writer)
        .await?;
        debug!("Stored item record");
        Ok(())
    }

    async fn get_item(&self, item_id: &str) -> Result<Item> {
        let row = sqlx::query("SELECT * FROM items WHERE item_id = ?")
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::ItemNotFound(item_id.to_string()))?;
        item_from_row(&row)
    }

    async fn list_items(&self) -> Result<Vec<Item>> {
        let rows = sqlx::query("SELECT * FROM items ORDER BY item_id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(item_from_row).collect()
    }

    async fn set_item_status(&self, item_id: &str, status: ItemStatus) -> Result<()> {
        let result = sqlx::query("UPDATE items SET status = ?, updated_at = ? WHERE item_id = ?")
            .bind(status.to_string())
            .bind(Utc::now())
            .bind(item_id)
            .execute(&self.writer)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::ItemNotFound(item_id.to_string()));
        }
        Ok(())
    }

    async fn replace_credential(
        &self,
        item_id: &str,
        current: &EncryptedBlob,
        replacement: &EncryptedBlob,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE items SET credential = ?, updated_at = ? WHERE item_id = ? AND credential = ?",
        )
        .bind(serde_json::to_string(replacement)?)
        .bind(Utc::now())
        .bind(item_id)
        .bind(serde_json::to_string(current)?)
        .execute(&self.writer)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_item(&self, item_id: &str) -> Result<()> {
        let guard = self.locks.acquire(item_id).await;
        let mut tx = self.writer.begin().await?;

        let result = sqlx::query("DELETE FROM items WHERE item_id = ?")
            .bind(item_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::ItemNotFound(item_id.to_string()));
        }
        for table in ["cursors", "transactions", "balances"] {
            sqlx::query(&format!("DELETE FROM {} WHERE item_id = ?", table))
                .bind(item_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        drop(guard);
        self.locks.release(item_id);
        info!("Deleted item and purged its data");
        Ok(())
    }

    async fn put_cursor(&self, item_id: &str, cursor: &str, outcome: SyncOutcome) -> Result<()> {
        let _guard = self.locks.acquire(item_id).await;
        let record = cursor_from_update(
            item_id,
            &CursorUpdate {
                cursor: cursor.to_string(),
                has_more: outcome == SyncOutcome::Partial,
                outcome,
            },
        );
        let mut tx = self.writer.begin().await?;
        Self::ensure_item(&mut tx, item_id).await?;
        Self::upsert_cursor(&mut tx, &record).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_cursor(&self, item_id: &str) -> Result<Option<SyncCursor>> {
        let row = sqlx::query("SELECT * FROM cursors WHERE item_id = ?")
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let outcome: String = row.try_get("last_outcome")?;
        Ok(Some(SyncCursor {
            item_id: row.try_get("item_id")?,
            cursor: row.try_get("cursor")?,
            has_more: row.try_get("has_more")?,
            last_synced_at: row.try_get("last_synced_at")?,
            last_outcome: outcome.parse()?,
        }))
    }

    async fn apply_transaction_delta(
        &self,
        item_id: &str,
        delta: &TransactionDelta,
    ) -> Result<AppliedCounts> {
        let _guard = self.locks.acquire(item_id).await;
        let mut tx = self.writer.begin().await?;
        Self::ensure_item(&mut tx, item_id).await?;
        let counts = Self::apply_delta_in(&mut tx, item_id, delta).await?;
        tx.commit().await?;
        Ok(counts)
    }

    async fn commit_sync_page(
        &self,
        item_id: &str,
        expected_cursor: Option<&str>,
        delta: &TransactionDelta,
        update: &CursorUpdate,
    ) -> Result<AppliedCounts> {
        let _guard = self.locks.acquire(item_id).await;
        let mut tx = self.writer.begin().await?;

        Self::ensure_item(&mut tx, item_id).await?;
        let stored = Self::stored_cursor(&mut tx, item_id).await?;
        if stored.as_deref() != expected_cursor {
            // Dropping `tx` rolls back.
            return Err(EngineError::CursorConflict(item_id.to_string()));
        }

        let counts = Self::apply_delta_in(&mut tx, item_id, delta).await?;
        Self::upsert_cursor(&mut tx, &cursor_from_update(item_id, update)).await?;
        tx.commit().await?;

        debug!(
            added = counts.added,
            modified = counts.modified,
            removed = counts.removed,
            "Committed sync page"
        );
        Ok(counts)
    }

    async fn get_transactions(
        &self,
        item_id: &str,
        since: Option<NaiveDate>,
    ) -> Result<Vec<Transaction>> {
        let rows = match since {
            Some(since) => {
                sqlx::query(&format!(
                    "SELECT {} FROM transactions WHERE item_id = ? AND removed = FALSE AND posted_on >= ? \
                     ORDER BY posted_on ASC, transaction_id ASC",
                    TRANSACTION_COLUMNS
                ))
                .bind(item_id)
                .bind(since)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM transactions WHERE item_id = ? AND removed = FALSE \
                     ORDER BY posted_on ASC, transaction_id ASC",
                    TRANSACTION_COLUMNS
                ))
                .bind(item_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(transaction_from_row).collect()
    }

    async fn get_transaction(
        &self,
        item_id: &str,
        transaction_id: &str,
    ) -> Result<Option<Transaction>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transactions WHERE item_id = ? AND transaction_id = ?",
            TRANSACTION_COLUMNS
        ))
        .bind(item_id)
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn put_balance_snapshot(&self, snapshot: &BalanceSnapshot) -> Result<()> {
        let balance = &snapshot.balance;
        let result = sqlx::query(
            r#"
            INSERT INTO balances (
              item_id, account_id, name, mask, account_type, available, current,
              iso_currency_code, captured_at
            )
            SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?
            WHERE EXISTS (SELECT 1 FROM items WHERE item_id = ?)
            "#,
        )
        .bind(&snapshot.item_id)
        .bind(&balance.account_id)
        .bind(&balance.name)
        .bind(&balance.mask)
        .bind(&balance.account_type)
        .bind(balance.available.map(|d| d.to_string()))
        .bind(balance.current.map(|d| d.to_string()))
        .bind(&balance.iso_currency_code)
        .bind(snapshot.captured_at)
        .bind(&snapshot.item_id)
        .execute(&self.writer)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::ItemNotFound(snapshot.item_id.clone()));
        }
        Ok(())
    }

    async fn get_latest_balance_snapshot(
        &self,
        item_id: &str,
        account_id: &str,
    ) -> Result<Option<BalanceSnapshot>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM balances WHERE item_id = ? AND account_id = ? \
             ORDER BY snapshot_id DESC LIMIT 1",
            BALANCE_COLUMNS
        ))
        .bind(item_id)
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn get_latest_balance_snapshots(&self, item_id: &str) -> Result<Vec<BalanceSnapshot>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM balances b \
             WHERE b.item_id = ? AND b.snapshot_id = ( \
               SELECT MAX(snapshot_id) FROM balances \
               WHERE item_id = b.item_id AND account_id = b.account_id) \
             ORDER BY b.account_id ASC",
            BALANCE_COLUMNS
        ))
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(snapshot_from_row).collect()
    }

    async fn close(&self) {
        self.pool.close().await;
        self.writer.close().await;
        info!("SQLite storage closed");
    }
}
