//! Balance cache with TTL and force-refresh
//!
//! Freshness is decided per item, not per account: if any requested account
//! is stale or missing, the whole item's account set is refetched so a
//! response never mixes snapshots of different ages.
//!
//! A refresh stamps every account with one `captured_at`, so the snapshots
//! carrying the newest stamp are the item's current account set. Accounts
//! that dropped out upstream keep older snapshots and are ignored.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::aggregator::Aggregator;
use crate::credentials::ItemRegistry;
use crate::models::{AccountBalance, BalanceSnapshot, ItemStatus};
use crate::retry::RetryPolicy;
use crate::storage::StorageBackend;
use crate::Result;

pub const DEFAULT_TTL_SECS: i64 = 300;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BalanceResult {
    pub balances: Vec<AccountBalance>,
    pub cached: bool,
    /// Capture time of the returned data (oldest snapshot when cached)
    pub timestamp: DateTime<Utc>,
}

pub struct BalanceCache {
    registry: Arc<ItemRegistry>,
    storage: Arc<dyn StorageBackend>,
    aggregator: Arc<dyn Aggregator>,
    retry: RetryPolicy,
    ttl: Duration,
}

impl BalanceCache {
    pub fn new(
        registry: Arc<ItemRegistry>,
        storage: Arc<dyn StorageBackend>,
        aggregator: Arc<dyn Aggregator>,
        retry: RetryPolicy,
        ttl: Duration,
    ) -> Self {
        Self {
            registry,
            storage,
            aggregator,
            retry,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get_balances(
        &self,
        item_id: &str,
        account_ids: Option<&[String]>,
        force_refresh: bool,
    ) -> Result<BalanceResult> {
        // An empty filter means "all accounts".
        let account_ids = account_ids.filter(|ids| !ids.is_empty());

        if !force_refresh {
            if let Some(hit) = self.cached(item_id, account_ids).await? {
                debug!(item_id, accounts = hit.balances.len(), "Balance cache hit");
                return Ok(hit);
            }
        }

        self.refresh(item_id, account_ids).await
    }

    /// Serve from snapshots when every requested account is fresh.
    async fn cached(
        &self,
        item_id: &str,
        account_ids: Option<&[String]>,
    ) -> Result<Option<BalanceResult>> {
        let snapshots = self.storage.get_latest_balance_snapshots(item_id).await?;
        let Some(newest) = snapshots.iter().map(|s| s.captured_at).max() else {
            return Ok(None);
        };
        let snapshots: Vec<BalanceSnapshot> = snapshots
            .into_iter()
            .filter(|s| s.captured_at == newest)
            .collect();

        let now = Utc::now();
        let selected: Vec<&BalanceSnapshot> = match account_ids {
            Some(ids) => {
                let mut selected = Vec::with_capacity(ids.len());
                for id in ids {
                    match snapshots.iter().find(|s| s.account_id() == id) {
                        Some(snapshot) => selected.push(snapshot),
                        None => return Ok(None),
                    }
                }
                selected
            }
            None => snapshots.iter().collect(),
        };

        if selected.iter().any(|s| now - s.captured_at > self.ttl) {
            return Ok(None);
        }

        let timestamp = selected
            .iter()
            .map(|s| s.captured_at)
            .min()
            .unwrap_or(now);

        // Keep snapshot order and drop duplicates from the filter.
        let balances = snapshots
            .iter()
            .filter(|s| selected.iter().any(|sel| sel.account_id() == s.account_id()))
            .map(|s| s.balance.clone())
            .collect();

        Ok(Some(BalanceResult {
            balances,
            cached: true,
            timestamp,
        }))
    }

    /// Fetch the item's full account set, snapshot it, then filter.
    async fn refresh(
        &self,
        item_id: &str,
        account_ids: Option<&[String]>,
    ) -> Result<BalanceResult> {
        let (_, token) = self.registry.credential(item_id).await?;

        let fetched = self
            .retry
            .run("balance_get", || self.aggregator.get_balances(&token, None))
            .await;

        let balances = match fetched {
            Ok(balances) => balances,
            Err(e) => {
                if e.requires_relink() {
                    if let Err(status_err) = self
                        .registry
                        .set_status(item_id, ItemStatus::LoginRequired)
                        .await
                    {
                        warn!(item_id, error = %status_err, "Failed to record item status");
                    }
                }
                return Err(e);
            }
        };

        let captured_at = Utc::now();
        for balance in &balances {
            self.storage
                .put_balance_snapshot(&BalanceSnapshot::new(item_id, balance.clone(), captured_at))
                .await?;
        }

        info!(item_id, accounts = balances.len(), "Balances refreshed");

        let balances = match account_ids {
            Some(ids) => balances
                .into_iter()
                .filter(|b| ids.contains(&b.account_id))
                .collect(),
            None => balances,
        };

        Ok(BalanceResult {
            balances,
            cached: false,
            timestamp: captured_at,
        })
    }
}
