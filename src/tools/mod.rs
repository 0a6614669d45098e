//! Tool trait and registry
//!
//! Each tool takes a JSON object of parameters and returns a `ToolOutput`.
//! Failures never escape as raw errors: the registry renders them as a
//! structured `{ kind, retryable, message }` body.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use chrono::NaiveDate;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::balance::BalanceCache;
use crate::credentials::ItemRegistry;
use crate::error::EngineError;
use crate::models::{ToolInput, ToolOutput};
use crate::reconciler::{Reconciler, SyncRequest};
use crate::storage::StorageBackend;
use crate::vault::AccessToken;
use crate::Result;

/// Trait for a single tool
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: &'static str,
    pub description: &'static str,
}

/// Tool registry for looking up and executing tools
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<ToolInfo> {
        let mut tools: Vec<ToolInfo> = self
            .tools
            .values()
            .map(|t| ToolInfo {
                name: t.name(),
                description: t.description(),
            })
            .collect();
        tools.sort_by_key(|t| t.name);
        tools
    }

    /// Run a tool by name. Errors come back inside the output.
    pub async fn execute(&self, input: &ToolInput) -> ToolOutput {
        let Some(tool) = self.get(&input.tool_name) else {
            let err = EngineError::ToolNotFound(input.tool_name.clone());
            warn!(tool = %input.tool_name, "Unknown tool requested");
            return ToolOutput::failed(&err);
        };

        debug!(tool = %input.tool_name, "Executing tool");
        match tool.execute(input).await {
            Ok(output) => output,
            Err(err) => {
                warn!(
                    tool = %input.tool_name,
                    kind = ?err.kind(),
                    retryable = err.is_retryable(),
                    error = %err,
                    "Tool failed"
                );
                ToolOutput::failed(&err)
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_params<T: DeserializeOwned>(input: &ToolInput) -> Result<T> {
    let params = match &input.parameters {
        Value::Null => json!({}),
        Value::Object(_) => input.parameters.clone(),
        _ => {
            return Err(EngineError::InvalidToolInput(
                "tool parameters must be a JSON object".to_string(),
            ))
        }
    };
    serde_json::from_value(params).map_err(|e| EngineError::InvalidToolInput(e.to_string()))
}

//
// ================= Sync =================
//

pub struct SyncTransactionsTool {
    reconciler: Arc<Reconciler>,
}

impl SyncTransactionsTool {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }
}

#[async_trait::async_trait]
impl Tool for SyncTransactionsTool {
    fn name(&self) -> &'static str {
        "sync_transactions"
    }

    fn description(&self) -> &'static str {
        "Incrementally sync an item's transactions (item_id, force_refresh=false, days_requested=90)"
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let request: SyncRequest = parse_params(input)?;
        let result = self.reconciler.sync(&request).await?;
        Ok(ToolOutput::ok(serde_json::to_value(result)?))
    }
}

#[derive(Deserialize)]
struct GetTransactionsParams {
    item_id: String,
    #[serde(default)]
    since: Option<NaiveDate>,
}

/// Read side of the mirror: live transactions as last committed.
pub struct GetTransactionsTool {
    storage: Arc<dyn StorageBackend>,
}

impl GetTransactionsTool {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }
}

#[async_trait::async_trait]
impl Tool for GetTransactionsTool {
    fn name(&self) -> &'static str {
        "get_transactions"
    }

    fn description(&self) -> &'static str {
        "Stored transactions by posting date, tombstones excluded (item_id, since=YYYY-MM-DD?)"
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let params: GetTransactionsParams = parse_params(input)?;
        // Unknown items are an error, not an empty list.
        self.storage.get_item(&params.item_id).await?;

        let transactions = self
            .storage
            .get_transactions(&params.item_id, params.since)
            .await?;
        Ok(ToolOutput::ok(json!({
            "item_id": params.item_id,
            "count": transactions.len(),
            "transactions": transactions,
        })))
    }
}

//
// ================= Balances =================
//

#[derive(Deserialize)]
struct GetBalanceParams {
    item_id: String,
    #[serde(default)]
    account_ids: Option<Vec<String>>,
    #[serde(default)]
    force_refresh: bool,
}

pub struct GetBalanceTool {
    cache: Arc<BalanceCache>,
}

impl GetBalanceTool {
    pub fn new(cache: Arc<BalanceCache>) -> Self {
        Self { cache }
    }
}

#[async_trait::async_trait]
impl Tool for GetBalanceTool {
    fn name(&self) -> &'static str {
        "get_balance"
    }

    fn description(&self) -> &'static str {
        "Current account balances with short-lived caching (item_id, account_ids?, force_refresh=false)"
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let params: GetBalanceParams = parse_params(input)?;
        if params.item_id.trim().is_empty() {
            return Err(EngineError::InvalidToolInput(
                "item_id must not be empty".to_string(),
            ));
        }

        let result = self
            .cache
            .get_balances(
                &params.item_id,
                params.account_ids.as_deref(),
                params.force_refresh,
            )
            .await?;
        Ok(ToolOutput::ok(serde_json::to_value(result)?))
    }
}

//
// ================= Item management =================
//

#[derive(Deserialize)]
struct RegisterItemParams {
    item_id: String,
    access_token: String,
    #[serde(default)]
    institution_name: Option<String>,
}

pub struct RegisterItemTool {
    registry: Arc<ItemRegistry>,
}

impl RegisterItemTool {
    pub fn new(registry: Arc<ItemRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait::async_trait]
impl Tool for RegisterItemTool {
    fn name(&self) -> &'static str {
        "register_item"
    }

    fn description(&self) -> &'static str {
        "Store an item's access token encrypted at rest (item_id, access_token, institution_name?)"
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let params: RegisterItemParams = parse_params(input)?;
        let token = AccessToken::new(params.access_token);
        let summary = self
            .registry
            .register(&params.item_id, &token, params.institution_name)
            .await?;
        Ok(ToolOutput::ok(serde_json::to_value(summary)?))
    }
}

#[derive(Deserialize)]
struct ItemIdParams {
    item_id: String,
}

pub struct RemoveItemTool {
    registry: Arc<ItemRegistry>,
}

impl RemoveItemTool {
    pub fn new(registry: Arc<ItemRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait::async_trait]
impl Tool for RemoveItemTool {
    fn name(&self) -> &'static str {
        "remove_item"
    }

    fn description(&self) -> &'static str {
        "Delete an item with its credential, cursor, transactions and balances (item_id)"
    }

    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput> {
        let params: ItemIdParams = parse_params(input)?;
        self.registry.remove(&params.item_id).await?;
        Ok(ToolOutput::ok(json!({
            "item_id": params.item_id,
            "removed": true,
        })))
    }
}

pub struct ListItemsTool {
    registry: Arc<ItemRegistry>,
}

impl ListItemsTool {
    pub fn new(registry: Arc<ItemRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait::async_trait]
impl Tool for ListItemsTool {
    fn name(&self) -> &'static str {
        "list_items"
    }

    fn description(&self) -> &'static str {
        "List registered items and their status"
    }

    async fn execute(&self, _input: &ToolInput) -> Result<ToolOutput> {
        let items = self.registry.list().await?;
        Ok(ToolOutput::ok(json!({
            "count": items.len(),
            "items": items,
        })))
    }
}

/// Registry with every tool wired to the given engine components.
pub fn create_registry(
    reconciler: Arc<Reconciler>,
    cache: Arc<BalanceCache>,
    items: Arc<ItemRegistry>,
    storage: Arc<dyn StorageBackend>,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register(Arc::new(SyncTransactionsTool::new(reconciler)));
    registry.register(Arc::new(GetTransactionsTool::new(storage)));
    registry.register(Arc::new(GetBalanceTool::new(cache)));
    registry.register(Arc::new(RegisterItemTool::new(items.clone())));
    registry.register(Arc::new(RemoveItemTool::new(items.clone())));
    registry.register(Arc::new(ListItemsTool::new(items)));

    info!(tools = registry.tools.len(), "Tool registry ready");
    registry
}
