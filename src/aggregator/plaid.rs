//! Plaid API client
//!
//! Talks to `/transactions/sync`, `/transactions/refresh` and
//! `/accounts/balance/get`. Uses a long-lived reqwest::Client for connection
//! pooling. Error responses are mapped onto the engine's aggregator error
//! taxonomy; the access token never appears in a mapped message.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{Aggregator, RefreshStatus, SyncPage};
use crate::error::EngineError;
use crate::models::{AccountBalance, Transaction};
use crate::vault::AccessToken;
use crate::Result;

/// Page size requested from `/transactions/sync` (Plaid's maximum)
pub const SYNC_PAGE_SIZE: u32 = 500;

const DEFAULT_CURRENCY: &str = "USD";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaidEnvironment {
    Sandbox,
    Development,
    Production,
}

impl PlaidEnvironment {
    pub fn base_url(&self) -> &'static str {
        match self {
            PlaidEnvironment::Sandbox => "https://sandbox.plaid.com",
            PlaidEnvironment::Development => "https://development.plaid.com",
            PlaidEnvironment::Production => "https://production.plaid.com",
        }
    }
}

impl fmt::Display for PlaidEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlaidEnvironment::Sandbox => "sandbox",
            PlaidEnvironment::Development => "development",
            PlaidEnvironment::Production => "production",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for PlaidEnvironment {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sandbox" => Ok(PlaidEnvironment::Sandbox),
            "development" => Ok(PlaidEnvironment::Development),
            "production" => Ok(PlaidEnvironment::Production),
            other => Err(EngineError::Config(format!(
                "PLAID_ENV must be sandbox, development or production, got '{}'",
                other
            ))),
        }
    }
}

/// Reusable Plaid client (connection-pooled)
pub struct PlaidClient {
    client: Client,
    client_id: String,
    secret: String,
    base_url: String,
}

impl PlaidClient {
    pub fn new(client_id: String, secret: String, base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| EngineError::Config(format!("Failed to build HTTP client: {}", e)))?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        info!(base_url = %base_url, "PlaidClient initialized");

        Ok(Self {
            client,
            client_id,
            secret,
            base_url,
        })
    }

    pub fn for_environment(
        client_id: String,
        secret: String,
        environment: PlaidEnvironment,
    ) -> Result<Self> {
        Self::new(client_id, secret, environment.base_url())
    }

    /// POST an authenticated request and decode the JSON reply.
    async fn post<B, R>(&self, path: &str, token: &AccessToken, body: B) -> Result<R>
    where
        B: Serialize + Send,
        R: DeserializeOwned + Send,
    {
        let url = format!("{}{}", self.base_url, path);
        let request = Authenticated {
            client_id: &self.client_id,
            secret: &self.secret,
            access_token: token.expose(),
            body,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!(path, "Plaid request failed: {}", e);
                map_transport_error(&e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let err = map_error_response(status, &text, token);
            warn!(path, status = status.as_u16(), error = %err, "Plaid returned an error");
            return Err(err);
        }

        response.json::<R>().await.map_err(|e| {
            error!(path, "Failed to parse Plaid response: {}", e);
            if e.is_decode() {
                EngineError::Validation(format!("malformed aggregator response for {}", path))
            } else {
                map_transport_error(&e)
            }
        })
    }
}

#[async_trait]
impl Aggregator for PlaidClient {
    async fn sync_transactions_page(
        &self,
        token: &AccessToken,
        cursor: Option<&str>,
        days_requested: Option<u32>,
    ) -> Result<SyncPage> {
        debug!(has_cursor = cursor.is_some(), "Syncing transactions page");

        let options = match (cursor, days_requested) {
            (None, Some(days)) => Some(SyncOptions {
                days_requested: days,
            }),
            _ => None,
        };

        let response: SyncResponse = self
            .post(
                "/transactions/sync",
                token,
                SyncRequest {
                    cursor,
                    count: SYNC_PAGE_SIZE,
                    options,
                },
            )
            .await?;

        let received_at = Utc::now();
        let page = SyncPage {
            added: response
                .added
                .into_iter()
                .map(|t| t.into_transaction(received_at))
                .collect(),
            modified: response
                .modified
                .into_iter()
                .map(|t| t.into_transaction(received_at))
                .collect(),
            removed: response
                .removed
                .into_iter()
                .map(|r| r.transaction_id)
                .collect(),
            next_cursor: response.next_cursor,
            has_more: response.has_more,
        };

        debug!(
            added = page.added.len(),
            modified = page.modified.len(),
            removed = page.removed.len(),
            has_more = page.has_more,
            "Transactions page received"
        );
        Ok(page)
    }

    async fn refresh(&self, token: &AccessToken) -> Result<RefreshStatus> {
        info!("Triggering transaction refresh");
        let response: RefreshResponse = self
            .post("/transactions/refresh", token, Empty {})
            .await?;
        Ok(RefreshStatus {
            accepted: true,
            request_id: response.request_id,
        })
    }

    async fn get_balances(
        &self,
        token: &AccessToken,
        account_ids: Option<&[String]>,
    ) -> Result<Vec<AccountBalance>> {
        let options = account_ids.map(|ids| BalanceOptions {
            account_ids: ids.to_vec(),
        });

        let response: BalanceResponse = self
            .post("/accounts/balance/get", token, BalanceRequest { options })
            .await?;

        let balances: Vec<AccountBalance> = response
            .accounts
            .into_iter()
            .filter(|a| account_ids.map_or(true, |ids| ids.contains(&a.account_id)))
            .map(WireAccount::into_balance)
            .collect();

        info!(accounts = balances.len(), "Retrieved account balances");
        Ok(balances)
    }
}

//
// ================= Error mapping =================
//

fn map_transport_error(e: &reqwest::Error) -> EngineError {
    if e.is_timeout() {
        EngineError::TransientNetwork("aggregator request timed out".to_string())
    } else if e.is_connect() {
        EngineError::TransientNetwork("could not connect to aggregator".to_string())
    } else {
        EngineError::TransientNetwork(format!("aggregator request failed: {}", e))
    }
}

/// Map a non-2xx Plaid reply onto the engine's error taxonomy.
pub(crate) fn map_error_response(status: StatusCode, body: &str, token: &AccessToken) -> EngineError {
    let parsed: Option<PlaidErrorBody> = serde_json::from_str(body).ok();

    let (error_type, error_code, message) = match &parsed {
        Some(p) => (
            p.error_type.as_str(),
            p.error_code.as_str(),
            scrub(&p.error_message, token),
        ),
        None => ("", "", format!("HTTP {}", status.as_u16())),
    };
    let detail = if error_code.is_empty() {
        message
    } else {
        format!("{}: {}", error_code, message)
    };

    if status == StatusCode::TOO_MANY_REQUESTS
        || error_code == "RATE_LIMIT_EXCEEDED"
        || error_type == "RATE_LIMIT_EXCEEDED"
    {
        return EngineError::RateLimited(detail);
    }

    match error_code {
        "ITEM_LOGIN_REQUIRED" => return EngineError::ItemError(detail),
        "INVALID_ACCESS_TOKEN" | "INVALID_API_KEYS" => {
            return EngineError::InvalidCredential(detail)
        }
        _ => {}
    }

    match error_type {
        "ITEM_ERROR" => EngineError::ItemError(detail),
        "API_ERROR" | "INSTITUTION_ERROR" => EngineError::TransientNetwork(detail),
        _ if status.is_server_error() => EngineError::TransientNetwork(detail),
        _ => EngineError::Validation(format!("aggregator rejected request: {}", detail)),
    }
}

/// Drop any echo of the access token from upstream text.
fn scrub(message: &str, token: &AccessToken) -> String {
    if token.expose().is_empty() {
        return message.to_string();
    }
    message.replace(token.expose(), "<redacted>")
}

//
// ================= Wire types =================
//

#[derive(Serialize)]
struct Authenticated<'a, B> {
    client_id: &'a str,
    secret: &'a str,
    access_token: &'a str,
    #[serde(flatten)]
    body: B,
}

#[derive(Serialize)]
struct Empty {}

#[derive(Serialize)]
struct SyncRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<&'a str>,
    count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<SyncOptions>,
}

#[derive(Serialize)]
struct SyncOptions {
    days_requested: u32,
}

#[derive(Deserialize)]
struct SyncResponse {
    #[serde(default)]
    added: Vec<WireTransaction>,
    #[serde(default)]
    modified: Vec<WireTransaction>,
    #[serde(default)]
    removed: Vec<WireRemoved>,
    #[serde(default)]
    next_cursor: String,
    #[serde(default)]
    has_more: bool,
}

#[derive(Deserialize)]
struct WireTransaction {
    transaction_id: String,
    account_id: String,
    amount: Decimal,
    #[serde(default)]
    iso_currency_code: Option<String>,
    #[serde(default)]
    unofficial_currency_code: Option<String>,
    date: NaiveDate,
    #[serde(default)]
    merchant_name: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    personal_finance_category: Option<WireCategory>,
    #[serde(default)]
    category: Option<Vec<String>>,
    #[serde(default)]
    pending: bool,
}

#[derive(Deserialize)]
struct WireCategory {
    primary: String,
}

impl WireTransaction {
    /// Plaid sends no per-record modification time; the page's receipt time
    /// stands in, so a later page always supersedes an earlier one.
    fn into_transaction(self, received_at: DateTime<Utc>) -> Transaction {
        let category = self
            .personal_finance_category
            .map(|c| c.primary)
            .or_else(|| self.category.filter(|c| !c.is_empty()).map(|c| c.join(" > ")));

        Transaction {
            transaction_id: self.transaction_id,
            account_id: self.account_id,
            amount: self.amount,
            iso_currency_code: self
                .iso_currency_code
                .or(self.unofficial_currency_code)
                .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            date: self.date,
            merchant_name: self.merchant_name.or(self.name),
            category,
            pending: self.pending,
            removed: false,
            removed_at: None,
            last_modified: received_at,
        }
    }
}

#[derive(Deserialize)]
struct WireRemoved {
    transaction_id: String,
}

#[derive(Deserialize)]
struct RefreshResponse {
    #[serde(default)]
    request_id: Option<String>,
}

#[derive(Serialize)]
struct BalanceRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<BalanceOptions>,
}

#[derive(Serialize)]
struct BalanceOptions {
    account_ids: Vec<String>,
}

#[derive(Deserialize)]
struct BalanceResponse {
    #[serde(default)]
    accounts: Vec<WireAccount>,
}

#[derive(Deserialize)]
struct WireAccount {
    account_id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    mask: Option<String>,
    #[serde(default, rename = "type")]
    account_type: Option<String>,
    balances: WireBalances,
}

#[derive(Deserialize)]
struct WireBalances {
    #[serde(default)]
    available: Option<Decimal>,
    #[serde(default)]
    current: Option<Decimal>,
    #[serde(default)]
    iso_currency_code: Option<String>,
    #[serde(default)]
    unofficial_currency_code: Option<String>,
}

impl WireAccount {
    fn into_balance(self) -> AccountBalance {
        AccountBalance {
            account_id: self.account_id,
            name: self.name,
            mask: self.mask,
            account_type: self.account_type,
            available: self.balances.available,
            current: self.balances.current,
            iso_currency_code: self
                .balances
                .iso_currency_code
                .or(self.balances.unofficial_currency_code)
                .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
        }
    }
}

#[derive(Deserialize)]
struct PlaidErrorBody {
    #[serde(default)]
    error_type: String,
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    error_message: String,
}
