//! Remote aggregator contract
//!
//! The reconciler and the balance cache only ever talk to `dyn Aggregator`,
//! so tests swap in an in-process fake and production uses [`PlaidClient`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{AccountBalance, Transaction, TransactionDelta};
use crate::vault::AccessToken;
use crate::Result;

pub mod plaid;

pub use plaid::{PlaidClient, PlaidEnvironment};

/// One page of `/transactions/sync` output
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncPage {
    pub added: Vec<Transaction>,
    pub modified: Vec<Transaction>,
    pub removed: Vec<String>,
    pub next_cursor: String,
    pub has_more: bool,
}

impl SyncPage {
    /// Split the page into the delta to merge and its cursor advance.
    pub fn into_parts(self) -> (TransactionDelta, String, bool) {
        (
            TransactionDelta {
                added: self.added,
                modified: self.modified,
                removed: self.removed,
            },
            self.next_cursor,
            self.has_more,
        )
    }
}

/// Result of asking the aggregator to refresh an item upstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshStatus {
    pub accepted: bool,
    pub request_id: Option<String>,
}

/// Trait for a remote transaction/balance aggregator
///
/// Implementations map their failures onto `RateLimited`,
/// `InvalidCredential`, `TransientNetwork` and `ItemError`, and never put
/// the access token into an error message.
#[async_trait]
pub trait Aggregator: Send + Sync {
    /// Fetch one page of changes. `days_requested` is only meaningful when
    /// `cursor` is `None`.
    async fn sync_transactions_page(
        &self,
        token: &AccessToken,
        cursor: Option<&str>,
        days_requested: Option<u32>,
    ) -> Result<SyncPage>;

    async fn refresh(&self, token: &AccessToken) -> Result<RefreshStatus>;

    async fn get_balances(
        &self,
        token: &AccessToken,
        account_ids: Option<&[String]>,
    ) -> Result<Vec<AccountBalance>>;
}
