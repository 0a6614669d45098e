//! Flat-file storage backend
//!
//! Layout under `<data_dir>/items/<sha256(item_id)>/`:
//!
//! - `item.json`          item record with the sealed credential
//! - `transactions.jsonl` append-only log of upsert/tombstone records, each
//!                        tagged with the commit sequence it belongs to
//! - `cursor.json`        `{ committed_seq, cursor }`
//! - `balances.jsonl`     append-only balance snapshots
//!
//! `cursor.json` is the commit point. A log group with sequence N is only
//! visible once `cursor.json` says `committed_seq >= N`, and that file is
//! replaced with write-then-rename. A crash or a dropped task between the
//! log append and the rename leaves an invisible tail that the next writer
//! truncates. Writers hold the per-item lock and run on the blocking pool.
//!
//! Once the committed log holds more than twice as many records as there are
//! transactions (and at least `compact_after` records), it is rewritten as
//! one upsert per transaction, tombstones included, and swapped in with
//! write-then-rename.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::merge::{apply_ops, plan_delta, MergeOp, StoredState};
use super::{cursor_from_update, sort_transactions, ItemLocks, StorageBackend};
use crate::error::EngineError;
use crate::models::{
    AppliedCounts, BalanceSnapshot, CursorUpdate, Item, ItemStatus, SyncCursor, SyncOutcome,
    Transaction, TransactionDelta,
};
use crate::vault::EncryptedBlob;
use crate::Result;

const ITEM_FILE: &str = "item.json";
const CURSOR_FILE: &str = "cursor.json";
const LOG_FILE: &str = "transactions.jsonl";
const BALANCES_FILE: &str = "balances.jsonl";

const DEFAULT_COMPACT_AFTER: usize = 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CursorRecord {
    committed_seq: u64,
    cursor: Option<SyncCursor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogRecord {
    Upsert {
        seq: u64,
        transaction: Transaction,
    },
    Tombstone {
        seq: u64,
        transaction_id: String,
        removed_at: chrono::DateTime<Utc>,
    },
}

impl LogRecord {
    fn seq(&self) -> u64 {
        match self {
            LogRecord::Upsert { seq, .. } | LogRecord::Tombstone { seq, .. } => *seq,
        }
    }

    fn from_op(seq: u64, op: &MergeOp) -> Self {
        match op {
            MergeOp::Upsert(txn) => LogRecord::Upsert {
                seq,
                transaction: txn.clone(),
            },
            MergeOp::Tombstone {
                transaction_id,
                removed_at,
            } => LogRecord::Tombstone {
                seq,
                transaction_id: transaction_id.clone(),
                removed_at: *removed_at,
            },
        }
    }

    fn into_op(self) -> MergeOp {
        match self {
            LogRecord::Upsert { transaction, .. } => MergeOp::Upsert(transaction),
            LogRecord::Tombstone {
                transaction_id,
                removed_at,
                ..
            } => MergeOp::Tombstone {
                transaction_id,
                removed_at,
            },
        }
    }
}

/// Committed view of one item's transaction log
struct LogState {
    transactions: HashMap<String, Transaction>,
    /// Byte length of the committed prefix.
    committed_len: u64,
    total_len: u64,
    /// Records in the committed prefix.
    records: usize,
}

/// File-based storage using JSON and JSON-lines files
pub struct FileStorage {
    data_dir: PathBuf,
    locks: Arc<ItemLocks>,
    compact_after: usize,
}

impl FileStorage {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(data_dir.join("items"))?;
        info!(data_dir = %data_dir.display(), "File storage initialized");
        Ok(Self {
            data_dir,
            locks: Arc::new(ItemLocks::new()),
            compact_after: DEFAULT_COMPACT_AFTER,
        })
    }

    /// Minimum committed log length before compaction is considered.
    pub fn with_compact_after(mut self, records: usize) -> Self {
        self.compact_after = records.max(1);
        self
    }

    /// Item ids are opaque, so directory names are their SHA-256 digest.
    fn item_dir(&self, item_id: &str) -> PathBuf {
        let digest = Sha256::digest(item_id.as_bytes());
        self.data_dir.join("items").join(hex::encode(digest))
    }
}

//
// ================= Blocking helpers =================
//

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::Storage(format!("storage task failed: {}", e)))?
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write-then-rename so readers only ever see a whole file.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp)?;
        serde_json::to_writer(&mut file, value)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_cursor_record(dir: &Path) -> Result<CursorRecord> {
    Ok(read_json(&dir.join(CURSOR_FILE))?.unwrap_or_default())
}

/// Replay the committed prefix of the log.
///
/// Reading stops at the first line that is unparsable or belongs to an
/// uncommitted sequence; everything from there on is a torn tail.
fn replay_log(dir: &Path, committed_seq: u64) -> Result<LogState> {
    let path = dir.join(LOG_FILE);
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(LogState {
                transactions: HashMap::new(),
                committed_len: 0,
                total_len: 0,
                records: 0,
            })
        }
        Err(e) => return Err(e.into()),
    };
    let total_len = file.metadata()?.len();

    let mut reader = BufReader::new(file);
    let mut transactions = HashMap::new();
    let mut committed_len = 0u64;
    let mut records = 0usize;
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line)?;
        if read == 0 || line.last() != Some(&b'\n') {
            break;
        }
        let record: LogRecord = match serde_json::from_slice(&line) {
            Ok(record) => record,
            Err(_) => break,
        };
        if record.seq() > committed_seq {
            break;
        }
        apply_ops(&mut transactions, &[record.into_op()]);
        committed_len += read as u64;
        records += 1;
    }

    Ok(LogState {
        transactions,
        committed_len,
        total_len,
        records,
    })
}

fn needs_compaction(records: usize, live: usize, compact_after: usize) -> bool {
    records >= compact_after && records > live.saturating_mul(2)
}

/// Rewrite the log as one record per transaction, all in group `seq`.
///
/// `seq` must already be committed. Either the old or the new log is in
/// place at any instant and both replay to the same state.
fn compact_log(dir: &Path, seq: u64, transactions: &HashMap<String, Transaction>) -> Result<()> {
    let mut ordered: Vec<Transaction> = transactions.values().cloned().collect();
    sort_transactions(&mut ordered);

    let mut buf = Vec::new();
    for transaction in ordered {
        serde_json::to_writer(&mut buf, &LogRecord::Upsert { seq, transaction })?;
        buf.push(b'\n');
    }

    let path = dir.join(LOG_FILE);
    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, &path)?;
    Ok(())
}

fn ensure_item(dir: &Path, item_id: &str) -> Result<()> {
    if dir.join(ITEM_FILE).exists() {
        Ok(())
    } else {
        Err(EngineError::ItemNotFound(item_id.to_string()))
    }
}

/// Append one log group and move the commit point past it.
///
/// Caller must hold the item lock.
fn commit_group(
    dir: &Path,
    item_id: &str,
    expected_cursor: Option<Option<String>>,
    delta: &TransactionDelta,
    cursor: Option<SyncCursor>,
    compact_after: usize,
) -> Result<AppliedCounts> {
    ensure_item(dir, item_id)?;
    let record = read_cursor_record(dir)?;

    if let Some(expected) = expected_cursor {
        let stored = record.cursor.as_ref().map(|c| c.cursor.clone());
        if stored != expected {
            return Err(EngineError::CursorConflict(item_id.to_string()));
        }
    }

    let LogState {
        mut transactions,
        committed_len,
        total_len,
        records,
    } = replay_log(dir, record.committed_seq)?;
    let (ops, counts) = plan_delta(delta, Utc::now(), |id| {
        transactions.get(id).map(StoredState::from)
    });

    let log_path = dir.join(LOG_FILE);
    let mut log = OpenOptions::new()
        .create(true)
        .write(true)
        .open(&log_path)?;

    if total_len > committed_len {
        warn!(
            dropped_bytes = total_len - committed_len,
            "Truncating uncommitted transaction log tail"
        );
        log.set_len(committed_len)?;
    }

    let seq = record.committed_seq + 1;
    if !ops.is_empty() {
        let mut buf = Vec::new();
        for op in &ops {
            serde_json::to_writer(&mut buf, &LogRecord::from_op(seq, op))?;
            buf.push(b'\n');
        }
        log.seek(SeekFrom::Start(committed_len))?;
        log.write_all(&buf)?;
        log.sync_all()?;
    }
    drop(log);

    let next = CursorRecord {
        committed_seq: seq,
        cursor: cursor.or(record.cursor),
    };
    write_json_atomic(&dir.join(CURSOR_FILE), &next)?;

    let records = records + ops.len();
    apply_ops(&mut transactions, &ops);
    if needs_compaction(records, transactions.len(), compact_after) {
        compact_log(dir, seq, &transactions)?;
        debug!(
            before = records,
            after = transactions.len(),
            "Compacted transaction log"
        );
    }

    Ok(counts)
}

fn read_balances(dir: &Path) -> Result<Vec<BalanceSnapshot>> {
    let file = match File::open(dir.join(BALANCES_FILE)) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut snapshots = Vec::new();
    for line in BufReader::new(file).split(b'\n') {
        let line = line?;
        // A torn last line from an interrupted append is just not there yet.
        if let Ok(snapshot) = serde_json::from_slice::<BalanceSnapshot>(&line) {
            snapshots.push(snapshot);
        }
    }
    Ok(snapshots)
}

/// Last written snapshot per account, in first-seen account order.
fn latest_per_account(snapshots: Vec<BalanceSnapshot>) -> Vec<BalanceSnapshot> {
    let mut order: Vec<String> = Vec::new();
    let mut latest: HashMap<String, BalanceSnapshot> = HashMap::new();
    for snapshot in snapshots {
        let account_id = snapshot.account_id().to_string();
        if !latest.contains_key(&account_id) {
            order.push(account_id.clone());
        }
        latest.insert(account_id, snapshot);
    }
    order
        .into_iter()
        .filter_map(|account_id| latest.remove(&account_id))
        .collect()
}

#[async_trait]
impl StorageBackend for FileStorage {
    async fn put_item(&self, item: &Item) -> Result<()> {
        let dir = self.item_dir(&item.item_id);
        let guard = self.locks.acquire(&item.item_id).await;
        let item = item.clone();
        blocking(move || {
            let _guard = guard;
            fs::create_dir_all(&dir)?;
            write_json_atomic(&dir.join(ITEM_FILE), &item)
        })
        .await?;
        debug!("Stored item record");
        Ok(())
    }

    async fn get_item(&self, item_id: &str) -> Result<Item> {
        let path = self.item_dir(item_id).join(ITEM_FILE);
        let owned_id = item_id.to_string();
        blocking(move || {
            read_json::<Item>(&path)?.ok_or(EngineError::ItemNotFound(owned_id))
        })
        .await
    }

    async fn list_items(&self) -> Result<Vec<Item>> {
        let root = self.data_dir.join("items");
        let mut items = blocking(move || {
            let mut items = Vec::new();
            for entry in fs::read_dir(&root)? {
                let path = entry?.path().join(ITEM_FILE);
                if let Some(item) = read_json::<Item>(&path)? {
                    items.push(item);
                }
            }
            Ok(items)
        })
        .await?;
        items.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        Ok(items)
    }

    async fn set_item_status(&self, item_id: &str, status: ItemStatus) -> Result<()> {
        let dir = self.item_dir(item_id);
        let owned_id = item_id.to_string();
        let guard = self.locks.acquire(item_id).await;
        blocking(move || {
            let _guard = guard;
            let path = dir.join(ITEM_FILE);
            let mut item: Item =
                read_json(&path)?.ok_or(EngineError::ItemNotFound(owned_id))?;
            if item.status != status {
                item.status = status;
                item.updated_at = Utc::now();
                write_json_atomic(&path, &item)?;
            }
            Ok(())
        })
        .await
    }

    async fn replace_credential(
        &self,
        item_id: &str,
        current: &EncryptedBlob,
        replacement: &EncryptedBlob,
    ) -> Result<bool> {
        let dir = self.item_dir(item_id);
        let current = current.clone();
        let replacement = replacement.clone();
        let guard = self.locks.acquire(item_id).await;
        blocking(move || {
            let _guard = guard;
            let path = dir.join(ITEM_FILE);
            let Some(mut item) = read_json::<Item>(&path)? else {
                return Ok(false);
            };
            if item.credential != current {
                return Ok(false);
            }
            item.credential = replacement;
            item.updated_at = Utc::now();
            write_json_atomic(&path, &item)?;
            Ok(true)
        })
        .await
    }

    async fn delete_item(&self, item_id: &str) -> Result<()> {
        let dir = self.item_dir(item_id);
        let owned_id = item_id.to_string();
        let guard = self.locks.acquire(item_id).await;
        blocking(move || {
            let _guard = guard;
            if !dir.join(ITEM_FILE).exists() {
                return Err(EngineError::ItemNotFound(owned_id));
            }
            fs::remove_dir_all(&dir)?;
            Ok(())
        })
        .await?;
        self.locks.release(item_id);
        info!("Deleted item and purged its data");
        Ok(())
    }

    async fn put_cursor(&self, item_id: &str, cursor: &str, outcome: SyncOutcome) -> Result<()> {
        let dir = self.item_dir(item_id);
        let update = CursorUpdate {
            cursor: cursor.to_string(),
            has_more: outcome == SyncOutcome::Partial,
            outcome,
        };
        let record = cursor_from_update(item_id, &update);
        let owned_id = item_id.to_string();
        let guard = self.locks.acquire(item_id).await;
        blocking(move || {
            let _guard = guard;
            ensure_item(&dir, &owned_id)?;
            let mut current = read_cursor_record(&dir)?;
            current.cursor = Some(record);
            write_json_atomic(&dir.join(CURSOR_FILE), &current)
        })
        .await
    }

    async fn get_cursor(&self, item_id: &str) -> Result<Option<SyncCursor>> {
        let dir = self.item_dir(item_id);
        blocking(move || Ok(read_cursor_record(&dir)?.cursor)).await
    }

    async fn apply_transaction_delta(
        &self,
        item_id: &str,
        delta: &TransactionDelta,
    ) -> Result<AppliedCounts> {
        let dir = self.item_dir(item_id);
        let delta = delta.clone();
        let owned_id = item_id.to_string();
        let compact_after = self.compact_after;
        let guard = self.locks.acquire(item_id).await;
        blocking(move || {
            let _guard = guard;
            commit_group(&dir, &owned_id, None, &delta, None, compact_after)
        })
        .await
    }

    async fn commit_sync_page(
        &self,
        item_id: &str,
        expected_cursor: Option<&str>,
        delta: &TransactionDelta,
        update: &CursorUpdate,
    ) -> Result<AppliedCounts> {
        let dir = self.item_dir(item_id);
        let delta = delta.clone();
        let expected = Some(expected_cursor.map(str::to_string));
        let record = cursor_from_update(item_id, update);
        let owned_id = item_id.to_string();
        let compact_after = self.compact_after;
        let guard = self.locks.acquire(item_id).await;

        blocking(move || {
            let _guard = guard;
            commit_group(&dir, &owned_id, expected, &delta, Some(record), compact_after)
        })
        .await
    }

    async fn get_transactions(
        &self,
        item_id: &str,
        since: Option<NaiveDate>,
    ) -> Result<Vec<Transaction>> {
        let dir = self.item_dir(item_id);
        let mut transactions = blocking(move || {
            let record = read_cursor_record(&dir)?;
            let state = replay_log(&dir, record.committed_seq)?;
            Ok(state
                .transactions
                .into_values()
                .filter(|t| !t.removed)
                .filter(|t| since.map_or(true, |since| t.date >= since))
                .collect::<Vec<_>>())
        })
        .await?;
        sort_transactions(&mut transactions);
        Ok(transactions)
    }

    async fn get_transaction(
        &self,
        item_id: &str,
        transaction_id: &str,
    ) -> Result<Option<Transaction>> {
        let dir = self.item_dir(item_id);
        let transaction_id = transaction_id.to_string();
        blocking(move || {
            let record = read_cursor_record(&dir)?;
            let mut state = replay_log(&dir, record.committed_seq)?;
            Ok(state.transactions.remove(&transaction_id))
        })
        .await
    }

    async fn put_balance_snapshot(&self, snapshot: &BalanceSnapshot) -> Result<()> {
        let dir = self.item_dir(&snapshot.item_id);
        let owned_id = snapshot.item_id.clone();
        let mut line = serde_json::to_vec(snapshot)?;
        line.push(b'\n');
        let guard = self.locks.acquire(&snapshot.item_id).await;
        blocking(move || {
            let _guard = guard;
            ensure_item(&dir, &owned_id)?;
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(dir.join(BALANCES_FILE))?;
            // Seal off a torn line left by an interrupted append.
            let len = file.metadata()?.len();
            if len > 0 {
                let mut last = [0u8; 1];
                file.seek(SeekFrom::Start(len - 1))?;
                file.read_exact(&mut last)?;
                if last[0] != b'\n' {
                    file.write_all(b"\n")?;
                }
            }
            file.write_all(&line)?;
            file.sync_all()?;
            Ok(())
        })
        .await
    }

    async fn get_latest_balance_snapshot(
        &self,
        item_id: &str,
        account_id: &str,
    ) -> Result<Option<BalanceSnapshot>> {
        let account_id = account_id.to_string();
        Ok(self
            .get_latest_balance_snapshots(item_id)
            .await?
            .into_iter()
            .find(|s| s.account_id() == account_id))
    }

    async fn get_latest_balance_snapshots(&self, item_id: &str) -> Result<Vec<BalanceSnapshot>> {
        let dir = self.item_dir(item_id);
        let snapshots = blocking(move || read_balances(&dir)).await?;
        let mut latest = latest_per_account(snapshots);
        latest.sort_by(|a, b| a.account_id().cmp(b.account_id()));
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AccountBalance;
    use crate::vault::{AccessToken, KeyRing, Vault, VaultKey};
    use rust_decimal::Decimal;
    use tempfile::TempDir;

    fn txn(id: &str, date: &str) -> Transaction {
        Transaction {
            transaction_id: id.to_string(),
            account_id: "acc_1".to_string(),
            amount: Decimal::new(-4250, 2),
            iso_currency_code: "USD".to_string(),
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            merchant_name: Some("Acme".to_string()),
            category: None,
            pending: false,
            removed: false,
            removed_at: None,
            last_modified: Utc::now(),
        }
    }

    fn update(cursor: &str) -> CursorUpdate {
        CursorUpdate {
            cursor: cursor.to_string(),
            has_more: false,
            outcome: SyncOutcome::Complete,
        }
    }

    fn added(txns: Vec<Transaction>) -> TransactionDelta {
        TransactionDelta {
            added: txns,
            ..Default::default()
        }
    }

    fn item(item_id: &str) -> Item {
        let vault = Vault::new(KeyRing::new(1, VaultKey::generate()));
        Item {
            item_id: item_id.to_string(),
            credential: vault.seal(&AccessToken::new("access-token-1")).unwrap(),
            status: ItemStatus::Unknown,
            institution_name: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn registered(storage: FileStorage) -> FileStorage {
        storage.put_item(&item("it_1")).await.unwrap();
        storage
    }

    #[tokio::test]
    async fn test_item_round_trip_and_status() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        let vault = Vault::new(KeyRing::new(1, VaultKey::generate()));

        let item = Item {
            item_id: "it_1".to_string(),
            credential: vault.seal(&AccessToken::new("access-token-1")).unwrap(),
            status: ItemStatus::Healthy,
            institution_name: Some("First Platypus Bank".to_string()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        storage.put_item(&item).await.unwrap();

        storage
            .set_item_status("it_1", ItemStatus::LoginRequired)
            .await
            .unwrap();
        let loaded = storage.get_item("it_1").await.unwrap();
        assert_eq!(loaded.status, ItemStatus::LoginRequired);
        assert_eq!(vault.unseal(&loaded.credential).unwrap().expose(), "access-token-1");

        // Nothing on disk holds the plaintext.
        let raw = fs::read_to_string(storage.item_dir("it_1").join(ITEM_FILE)).unwrap();
        assert!(!raw.contains("access-token-1"));

        assert!(matches!(
            storage.get_item("missing").await,
            Err(EngineError::ItemNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_commit_page_and_cursor_conflict() {
        let dir = TempDir::new().unwrap();
        let storage = registered(FileStorage::new(dir.path()).unwrap()).await;

        let counts = storage
            .commit_sync_page("it_1", None, &added(vec![txn("T1", "2024-01-02")]), &update("c1"))
            .await
            .unwrap();
        assert_eq!(counts.added, 1);
        assert_eq!(storage.get_cursor("it_1").await.unwrap().unwrap().cursor, "c1");

        // A second writer still holding the old cursor applies nothing.
        let err = storage
            .commit_sync_page("it_1", None, &added(vec![txn("T9", "2024-01-09")]), &update("c9"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CursorConflict(ref id) if id == "it_1"));
        assert!(storage.get_transaction("it_1", "T9").await.unwrap().is_none());
        assert_eq!(storage.get_cursor("it_1").await.unwrap().unwrap().cursor, "c1");
    }

    #[tokio::test]
    async fn test_uncommitted_tail_is_invisible_and_truncated() {
        let dir = TempDir::new().unwrap();
        let storage = registered(FileStorage::new(dir.path()).unwrap()).await;
        storage
            .commit_sync_page("it_1", None, &added(vec![txn("T1", "2024-01-02")]), &update("c1"))
            .await
            .unwrap();

        // Simulate a crash after appending the next group but before the
        // commit rename, including a torn final line.
        let log_path = storage.item_dir("it_1").join(LOG_FILE);
        let mut log = OpenOptions::new().append(true).open(&log_path).unwrap();
        let orphan = LogRecord::Upsert {
            seq: 2,
            transaction: txn("T2", "2024-01-03"),
        };
        writeln!(log, "{}", serde_json::to_string(&orphan).unwrap()).unwrap();
        write!(log, "{{\"op\":\"upsert\",\"seq\":2,\"transa").unwrap();
        drop(log);

        let visible = storage.get_transactions("it_1", None).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(storage.get_cursor("it_1").await.unwrap().unwrap().cursor, "c1");

        storage
            .commit_sync_page(
                "it_1",
                Some("c1"),
                &added(vec![txn("T3", "2024-01-04")]),
                &update("c2"),
            )
            .await
            .unwrap();

        let ids: Vec<_> = storage
            .get_transactions("it_1", None)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.transaction_id)
            .collect();
        assert_eq!(ids, vec!["T1", "T3"]);
    }

    #[tokio::test]
    async fn test_since_filter_and_ordering() {
        let dir = TempDir::new().unwrap();
        let storage = registered(FileStorage::new(dir.path()).unwrap()).await;
        storage
            .apply_transaction_delta(
                "it_1",
                &added(vec![
                    txn("b", "2024-02-01"),
                    txn("a", "2024-02-01"),
                    txn("z", "2024-01-01"),
                ]),
            )
            .await
            .unwrap();

        let since = NaiveDate::from_ymd_opt(2024, 1, 15);
        let ids: Vec<_> = storage
            .get_transactions("it_1", since)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.transaction_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        // Delta without cursor leaves the cursor absent.
        assert!(storage.get_cursor("it_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_balance_is_last_written() {
        let dir = TempDir::new().unwrap();
        let storage = registered(FileStorage::new(dir.path()).unwrap()).await;

        let balance = |current: i64| AccountBalance {
            account_id: "acc_1".to_string(),
            name: Some("Checking".to_string()),
            mask: Some("0000".to_string()),
            account_type: Some("depository".to_string()),
            available: Some(Decimal::new(current, 2)),
            current: Some(Decimal::new(current, 2)),
            iso_currency_code: "USD".to_string(),
        };

        storage
            .put_balance_snapshot(&BalanceSnapshot::new("it_1", balance(100), Utc::now()))
            .await
            .unwrap();
        storage
            .put_balance_snapshot(&BalanceSnapshot::new("it_1", balance(250), Utc::now()))
            .await
            .unwrap();

        let latest = storage
            .get_latest_balance_snapshot("it_1", "acc_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.balance.current, Some(Decimal::new(250, 2)));
        assert_eq!(storage.get_latest_balance_snapshots("it_1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_deleted_item_rejects_late_writes() {
        let dir = TempDir::new().unwrap();
        let storage = registered(FileStorage::new(dir.path()).unwrap()).await;
        storage
            .commit_sync_page("it_1", None, &added(vec![txn("T1", "2024-01-02")]), &update("c1"))
            .await
            .unwrap();

        storage.delete_item("it_1").await.unwrap();

        let err = storage
            .commit_sync_page(
                "it_1",
                Some("c1"),
                &added(vec![txn("T2", "2024-01-03")]),
                &update("c2"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ItemNotFound(_)));
        assert!(matches!(
            storage.put_cursor("it_1", "c2", SyncOutcome::Complete).await,
            Err(EngineError::ItemNotFound(_))
        ));
        assert!(matches!(
            storage
                .put_balance_snapshot(&BalanceSnapshot::new(
                    "it_1",
                    AccountBalance {
                        account_id: "acc_1".to_string(),
                        name: None,
                        mask: None,
                        account_type: None,
                        available: None,
                        current: Some(Decimal::new(100, 2)),
                        iso_currency_code: "USD".to_string(),
                    },
                    Utc::now(),
                ))
                .await,
            Err(EngineError::ItemNotFound(_))
        ));

        // Nothing was recreated on disk.
        assert!(!storage.item_dir("it_1").exists());
        assert!(storage.get_cursor("it_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_log_is_compacted_without_changing_state() {
        let dir = TempDir::new().unwrap();
        let storage =
            registered(FileStorage::new(dir.path()).unwrap().with_compact_after(4)).await;

        storage
            .apply_transaction_delta(
                "it_1",
                &added(vec![txn("T1", "2024-01-02"), txn("T2", "2024-01-03")]),
            )
            .await
            .unwrap();
        storage
            .apply_transaction_delta(
                "it_1",
                &TransactionDelta {
                    removed: vec!["T2".to_string()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        for cents in 1..=6 {
            let mut modified = txn("T1", "2024-01-02");
            modified.amount = Decimal::new(cents, 2);
            storage
                .apply_transaction_delta(
                    "it_1",
                    &TransactionDelta {
                        modified: vec![modified],
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        let log = fs::read_to_string(storage.item_dir("it_1").join(LOG_FILE)).unwrap();
        assert!(log.lines().count() <= 4, "log not compacted: {}", log);

        let live = storage.get_transactions("it_1", None).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].amount, Decimal::new(6, 2));

        // The tombstone survives compaction and still blocks a re-add.
        assert!(storage.get_transaction("it_1", "T2").await.unwrap().unwrap().removed);
        let counts = storage
            .apply_transaction_delta("it_1", &added(vec![txn("T2", "2024-01-03")]))
            .await
            .unwrap();
        assert_eq!(counts.skipped, 1);
    }

    #[tokio::test]
    async fn test_replace_credential_keeps_status() {
        let dir = TempDir::new().unwrap();
        let storage = registered(FileStorage::new(dir.path()).unwrap()).await;
        storage
            .set_item_status("it_1", ItemStatus::LoginRequired)
            .await
            .unwrap();

        let current = storage.get_item("it_1").await.unwrap().credential;
        let replacement = item("it_1").credential;
        assert!(storage
            .replace_credential("it_1", &current, &replacement)
            .await
            .unwrap());

        let loaded = storage.get_item("it_1").await.unwrap();
        assert_eq!(loaded.credential, replacement);
        assert_eq!(loaded.status, ItemStatus::LoginRequired);

        // A stale expectation or a missing item swaps nothing.
        assert!(!storage
            .replace_credential("it_1", &current, &item("it_1").credential)
            .await
            .unwrap());
        assert_eq!(storage.get_item("it_1").await.unwrap().credential, replacement);
        assert!(!storage
            .replace_credential("missing", &current, &replacement)
            .await
            .unwrap());
    }
}
