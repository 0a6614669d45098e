//! Shared fixtures: a scripted in-process aggregator and an engine harness
//! over either storage backend.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use plaid_sync_tool::aggregator::{Aggregator, RefreshStatus, SyncPage};
use plaid_sync_tool::app::{App, EngineSettings};
use plaid_sync_tool::error::{EngineError, Result};
use plaid_sync_tool::models::{
    AccountBalance, AppliedCounts, BalanceSnapshot, CursorUpdate, Item, ItemStatus, SyncCursor,
    SyncOutcome, Transaction, TransactionDelta,
};
use plaid_sync_tool::retry::RetryPolicy;
use plaid_sync_tool::storage::{FileStorage, SqliteStorage, StorageBackend};
use plaid_sync_tool::vault::{AccessToken, EncryptedBlob, KeyRing, Vault, VaultKey};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const ITEM: &str = "it_1";
pub const TOKEN: &str = "access-sandbox-0f7e3c1a-2b9d-4e55-a1c8-6d2f90b47e13";

#[derive(Debug, Clone, Copy)]
pub enum Backend {
    File,
    Sqlite,
}

impl Backend {
    pub const ALL: [Backend; 2] = [Backend::File, Backend::Sqlite];
}

//
// ================= Fixtures =================
//

pub fn txn(id: &str, date: &str, cents: i64) -> Transaction {
    txn_at(id, date, cents, Utc::now())
}

pub fn txn_at(id: &str, date: &str, cents: i64, last_modified: DateTime<Utc>) -> Transaction {
    Transaction {
        transaction_id: id.to_string(),
        account_id: "acc_checking".to_string(),
        amount: Decimal::new(cents, 2),
        iso_currency_code: "USD".to_string(),
        date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
        merchant_name: Some("Corner Store".to_string()),
        category: Some("GENERAL_MERCHANDISE".to_string()),
        pending: false,
        removed: false,
        removed_at: None,
        last_modified,
    }
}

pub fn balance(account_id: &str, cents: i64) -> AccountBalance {
    AccountBalance {
        account_id: account_id.to_string(),
        name: Some(format!("{} account", account_id)),
        mask: Some("0000".to_string()),
        account_type: Some("depository".to_string()),
        available: Some(Decimal::new(cents, 2)),
        current: Some(Decimal::new(cents, 2)),
        iso_currency_code: "USD".to_string(),
    }
}

pub fn page(
    added: Vec<Transaction>,
    modified: Vec<Transaction>,
    removed: &[&str],
    next_cursor: &str,
    has_more: bool,
) -> SyncPage {
    SyncPage {
        added,
        modified,
        removed: removed.iter().map(|id| id.to_string()).collect(),
        next_cursor: next_cursor.to_string(),
        has_more,
    }
}

//
// ================= Fake aggregator =================
//

/// Pages are scripted per request cursor. An unscripted cursor answers with
/// an empty page that leaves the cursor where it is.
#[derive(Default)]
pub struct FakeAggregator {
    pages: Mutex<HashMap<Option<String>, SyncPage>>,
    sync_failures: Mutex<VecDeque<EngineError>>,
    balance_failures: Mutex<VecDeque<EngineError>>,
    refresh_failure: Mutex<Option<EngineError>>,
    balances: Mutex<Vec<AccountBalance>>,
    stalled: Mutex<HashSet<Option<String>>>,
    requests: Mutex<Vec<(Option<String>, Option<u32>)>>,
    pub sync_calls: AtomicU32,
    pub refresh_calls: AtomicU32,
    pub balance_calls: AtomicU32,
}

impl FakeAggregator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, cursor: Option<&str>, page: SyncPage) {
        self.pages
            .lock()
            .unwrap()
            .insert(cursor.map(str::to_string), page);
    }

    pub fn fail_sync(&self, err: EngineError) {
        self.sync_failures.lock().unwrap().push_back(err);
    }

    pub fn fail_balances(&self, err: EngineError) {
        self.balance_failures.lock().unwrap().push_back(err);
    }

    pub fn fail_refresh(&self, err: EngineError) {
        *self.refresh_failure.lock().unwrap() = Some(err);
    }

    pub fn set_balances(&self, balances: Vec<AccountBalance>) {
        *self.balances.lock().unwrap() = balances;
    }

    /// Requests for `cursor` hang until `resume` is called for it.
    pub fn stall(&self, cursor: Option<&str>) {
        self.stalled.lock().unwrap().insert(cursor.map(str::to_string));
    }

    pub fn resume(&self, cursor: Option<&str>) {
        self.stalled.lock().unwrap().remove(&cursor.map(str::to_string));
    }

    /// `(cursor, days_requested)` of every sync request, in order.
    pub fn requests(&self) -> Vec<(Option<String>, Option<u32>)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn syncs(&self) -> u32 {
        self.sync_calls.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> u32 {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn balance_fetches(&self) -> u32 {
        self.balance_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Aggregator for FakeAggregator {
    async fn sync_transactions_page(
        &self,
        token: &AccessToken,
        cursor: Option<&str>,
        days_requested: Option<u32>,
    ) -> Result<SyncPage> {
        assert_eq!(token.expose(), TOKEN);
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap()
            .push((cursor.map(str::to_string), days_requested));

        let stalled = self
            .stalled
            .lock()
            .unwrap()
            .contains(&cursor.map(str::to_string));
        if stalled {
            std::future::pending::<()>().await;
        }

        if let Some(err) = self.sync_failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        let scripted = self
            .pages
            .lock()
            .unwrap()
            .get(&cursor.map(str::to_string))
            .cloned();
        Ok(scripted.unwrap_or_else(|| SyncPage {
            next_cursor: cursor.unwrap_or("c0").to_string(),
            ..SyncPage::default()
        }))
    }

    async fn refresh(&self, token: &AccessToken) -> Result<RefreshStatus> {
        assert_eq!(token.expose(), TOKEN);
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        match self.refresh_failure.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(RefreshStatus {
                accepted: true,
                request_id: Some("req_refresh".to_string()),
            }),
        }
    }

    async fn get_balances(
        &self,
        token: &AccessToken,
        account_ids: Option<&[String]>,
    ) -> Result<Vec<AccountBalance>> {
        assert_eq!(token.expose(), TOKEN);
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.balance_failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        let balances = self.balances.lock().unwrap().clone();
        Ok(match account_ids {
            Some(ids) => balances
                .into_iter()
                .filter(|b| ids.contains(&b.account_id))
                .collect(),
            None => balances,
        })
    }
}

//
// ================= Interposed storage =================
//

/// Delegates to a real backend, with switches to fail commits or to change
/// an item's status right after a listing (as a concurrent writer would).
pub struct HookedStorage {
    inner: Arc<dyn StorageBackend>,
    fail_commits: AtomicBool,
    status_after_list: Mutex<Option<(String, ItemStatus)>>,
}

impl HookedStorage {
    pub fn new(inner: Arc<dyn StorageBackend>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_commits: AtomicBool::new(false),
            status_after_list: Mutex::new(None),
        })
    }

    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn set_status_after_list(&self, item_id: &str, status: ItemStatus) {
        *self.status_after_list.lock().unwrap() = Some((item_id.to_string(), status));
    }
}

#[async_trait]
impl StorageBackend for HookedStorage {
    async fn put_item(&self, item: &Item) -> Result<()> {
        self.inner.put_item(item).await
    }

    async fn get_item(&self, item_id: &str) -> Result<Item> {
        self.inner.get_item(item_id).await
    }

    async fn list_items(&self) -> Result<Vec<Item>> {
        let items = self.inner.list_items().await?;
        let pending = self.status_after_list.lock().unwrap().take();
        if let Some((item_id, status)) = pending {
            self.inner.set_item_status(&item_id, status).await?;
        }
        Ok(items)
    }

    async fn set_item_status(&self, item_id: &str, status: ItemStatus) -> Result<()> {
        self.inner.set_item_status(item_id, status).await
    }

    async fn replace_credential(
        &self,
        item_id: &str,
        current: &EncryptedBlob,
        replacement: &EncryptedBlob,
    ) -> Result<bool> {
        self.inner
            .replace_credential(item_id, current, replacement)
            .await
    }

    async fn delete_item(&self, item_id: &str) -> Result<()> {
        self.inner.delete_item(item_id).await
    }

    async fn put_cursor(&self, item_id: &str, cursor: &str, outcome: SyncOutcome) -> Result<()> {
        self.inner.put_cursor(item_id, cursor, outcome).await
    }

    async fn get_cursor(&self, item_id: &str) -> Result<Option<SyncCursor>> {
        self.inner.get_cursor(item_id).await
    }

    async fn apply_transaction_delta(
        &self,
        item_id: &str,
        delta: &TransactionDelta,
    ) -> Result<AppliedCounts> {
        self.inner.apply_transaction_delta(item_id, delta).await
    }

    async fn commit_sync_page(
        &self,
        item_id: &str,
        expected_cursor: Option<&str>,
        delta: &TransactionDelta,
        update: &CursorUpdate,
    ) -> Result<AppliedCounts> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(EngineError::Storage("disk full".to_string()));
        }
        self.inner
            .commit_sync_page(item_id, expected_cursor, delta, update)
            .await
    }

    async fn get_transactions(
        &self,
        item_id: &str,
        since: Option<NaiveDate>,
    ) -> Result<Vec<Transaction>> {
        self.inner.get_transactions(item_id, since).await
    }

    async fn get_transaction(
        &self,
        item_id: &str,
        transaction_id: &str,
    ) -> Result<Option<Transaction>> {
        self.inner.get_transaction(item_id, transaction_id).await
    }

    async fn put_balance_snapshot(&self, snapshot: &BalanceSnapshot) -> Result<()> {
        self.inner.put_balance_snapshot(snapshot).await
    }

    async fn get_latest_balance_snapshot(
        &self,
        item_id: &str,
        account_id: &str,
    ) -> Result<Option<BalanceSnapshot>> {
        self.inner
            .get_latest_balance_snapshot(item_id, account_id)
            .await
    }

    async fn get_latest_balance_snapshots(&self, item_id: &str) -> Result<Vec<BalanceSnapshot>> {
        self.inner.get_latest_balance_snapshots(item_id).await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

//
// ================= Harness =================
//

pub struct Harness {
    pub app: App,
    pub aggregator: Arc<FakeAggregator>,
    /// The real backend, bypassing `hooks`.
    pub storage: Arc<dyn StorageBackend>,
    /// What the engine writes through.
    pub hooks: Arc<HookedStorage>,
    /// Active vault key the harness registered `it_1` under.
    pub key: VaultKey,
    _dir: TempDir,
}

pub async fn open_backend(backend: Backend, dir: &TempDir) -> Arc<dyn StorageBackend> {
    match backend {
        Backend::File => Arc::new(FileStorage::new(dir.path().join("data")).unwrap()),
        Backend::Sqlite => {
            let url = format!("sqlite://{}", dir.path().join("plaid.db").display());
            Arc::new(SqliteStorage::connect(&url).await.unwrap())
        }
    }
}

pub fn test_settings() -> EngineSettings {
    EngineSettings {
        retry: RetryPolicy::immediate(),
        ..EngineSettings::default()
    }
}

/// Engine over a fresh backend with `it_1` registered.
pub async fn harness(backend: Backend) -> Harness {
    harness_with(backend, test_settings()).await
}

pub async fn harness_with(backend: Backend, settings: EngineSettings) -> Harness {
    let dir = TempDir::new().unwrap();
    let storage = open_backend(backend, &dir).await;
    let hooks = HookedStorage::new(storage.clone());
    let aggregator = FakeAggregator::new();
    let key = VaultKey::generate();
    let vault = Vault::new(KeyRing::new(1, key.clone()));

    let app = App::new(hooks.clone(), aggregator.clone(), vault, settings);
    app.items
        .register(ITEM, &AccessToken::new(TOKEN), Some("First Platypus Bank".to_string()))
        .await
        .unwrap();

    Harness {
        app,
        aggregator,
        storage,
        hooks,
        key,
        _dir: dir,
    }
}
