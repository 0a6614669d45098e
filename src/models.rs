//! Core data models for items, transactions, cursors and balances

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ErrorBody;
use crate::vault::EncryptedBlob;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Healthy,
    LoginRequired,
    Error,
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncOutcome {
    /// The aggregator reported no further pages.
    Complete,
    /// The page limit was hit while the aggregator still had more.
    Partial,
}

//
// ================= Item =================
//

/// One linked financial connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub item_id: String,
    pub credential: EncryptedBlob,
    pub status: ItemStatus,
    #[serde(default)]
    pub institution_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

//
// ================= Sync Cursor =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncCursor {
    pub item_id: String,
    pub cursor: String,
    pub has_more: bool,
    pub last_synced_at: DateTime<Utc>,
    pub last_outcome: SyncOutcome,
}

/// Cursor advance committed together with a page's delta
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CursorUpdate {
    pub cursor: String,
    pub has_more: bool,
    pub outcome: SyncOutcome,
}

//
// ================= Transactions =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub transaction_id: String,
    pub account_id: String,
    pub amount: Decimal,
    pub iso_currency_code: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub merchant_name: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    pub pending: bool,
    #[serde(default)]
    pub removed: bool,
    #[serde(default)]
    pub removed_at: Option<DateTime<Utc>>,
    pub last_modified: DateTime<Utc>,
}

/// One page of changes as delivered by the aggregator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionDelta {
    pub added: Vec<Transaction>,
    pub modified: Vec<Transaction>,
    pub removed: Vec<String>,
}

impl TransactionDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

/// What a delta application actually changed in storage
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppliedCounts {
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
    /// Stale updates, updates to tombstones and removals of unknown ids.
    pub skipped: usize,
}

//
// ================= Balances =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountBalance {
    pub account_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mask: Option<String>,
    #[serde(default, rename = "type")]
    pub account_type: Option<String>,
    pub available: Option<Decimal>,
    pub current: Option<Decimal>,
    pub iso_currency_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BalanceSnapshot {
    pub item_id: String,
    #[serde(flatten)]
    pub balance: AccountBalance,
    pub captured_at: DateTime<Utc>,
}

impl BalanceSnapshot {
    pub fn new(item_id: &str, balance: AccountBalance, captured_at: DateTime<Utc>) -> Self {
        Self {
            item_id: item_id.to_string(),
            balance,
            captured_at,
        }
    }

    pub fn account_id(&self) -> &str {
        &self.balance.account_id
    }
}

//
// ================= Tool I/O =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInput {
    pub tool_name: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolOutput {
    pub success: bool,
    pub data: serde_json::Value,
    pub error: Option<ErrorBody>,
}

impl ToolOutput {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn failed(err: &crate::error::EngineError) -> Self {
        Self {
            success: false,
            data: serde_json::Value::Null,
            error: Some(ErrorBody::from(err)),
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemStatus::Healthy => "healthy",
            ItemStatus::LoginRequired => "login_required",
            ItemStatus::Error => "error",
            ItemStatus::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = crate::error::EngineError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "healthy" => Ok(ItemStatus::Healthy),
            "login_required" => Ok(ItemStatus::LoginRequired),
            "error" => Ok(ItemStatus::Error),
            "unknown" => Ok(ItemStatus::Unknown),
            other => Err(crate::error::EngineError::Storage(format!(
                "unknown item status '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncOutcome::Complete => "complete",
            SyncOutcome::Partial => "partial",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for SyncOutcome {
    type Err = crate::error::EngineError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "complete" => Ok(SyncOutcome::Complete),
            "partial" => Ok(SyncOutcome::Partial),
            other => Err(crate::error::EngineError::Storage(format!(
                "unknown sync outcome '{}'",
                other
            ))),
        }
    }
}
