//! Application context
//!
//! Owns every long-lived component. Built once at startup with
//! [`App::from_config`] (or [`App::new`] when the caller supplies its own
//! storage and aggregator) and torn down with [`App::shutdown`].

use std::sync::Arc;
use tracing::info;

use crate::aggregator::{Aggregator, PlaidClient};
use crate::balance::{BalanceCache, DEFAULT_TTL_SECS};
use crate::config::{Config, StorageMode};
use crate::credentials::ItemRegistry;
use crate::error::EngineError;
use crate::models::{ToolInput, ToolOutput};
use crate::reconciler::{Reconciler, DEFAULT_MAX_PAGES};
use crate::retry::RetryPolicy;
use crate::storage::{FileStorage, SqliteStorage, StorageBackend};
use crate::tools::{create_registry, ToolRegistry};
use crate::vault::Vault;
use crate::Result;

/// Engine tuning knobs
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub retry: RetryPolicy,
    pub max_pages: u32,
    pub cache_ttl: chrono::Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_pages: DEFAULT_MAX_PAGES,
            cache_ttl: chrono::Duration::seconds(DEFAULT_TTL_SECS),
        }
    }
}

pub struct App {
    pub storage: Arc<dyn StorageBackend>,
    pub items: Arc<ItemRegistry>,
    pub reconciler: Arc<Reconciler>,
    pub balances: Arc<BalanceCache>,
    pub tools: Arc<ToolRegistry>,
}

impl App {
    /// Wire the engine around caller-supplied storage and aggregator.
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        aggregator: Arc<dyn Aggregator>,
        vault: Vault,
        settings: EngineSettings,
    ) -> Self {
        let items = Arc::new(ItemRegistry::new(storage.clone(), Arc::new(vault)));
        let reconciler = Arc::new(Reconciler::new(
            items.clone(),
            storage.clone(),
            aggregator.clone(),
            settings.retry,
            settings.max_pages,
        ));
        let balances = Arc::new(BalanceCache::new(
            items.clone(),
            storage.clone(),
            aggregator,
            settings.retry,
            settings.cache_ttl,
        ));
        let tools = Arc::new(create_registry(
            reconciler.clone(),
            balances.clone(),
            items.clone(),
            storage.clone(),
        ));

        Self {
            storage,
            items,
            reconciler,
            balances,
            tools,
        }
    }

    /// Open storage, build the Plaid client and wire the engine.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let storage = open_storage(&config.storage).await?;
        let aggregator = Arc::new(PlaidClient::new(
            config.plaid_client_id.clone(),
            config.plaid_secret.clone(),
            config.plaid_base_url(),
        )?);

        let cache_ttl = chrono::Duration::from_std(config.balance_cache_ttl)
            .map_err(|_| EngineError::Config("BALANCE_CACHE_TTL is out of range".to_string()))?;
        let settings = EngineSettings {
            max_pages: config.sync_max_pages,
            cache_ttl,
            ..EngineSettings::default()
        };

        info!(
            plaid_env = %config.plaid_env,
            sync_max_pages = settings.max_pages,
            cache_ttl_secs = cache_ttl.num_seconds(),
            "Engine configured"
        );

        Ok(Self::new(
            storage,
            aggregator,
            Vault::new(config.key_ring.clone()),
            settings,
        ))
    }

    pub async fn execute(&self, input: &ToolInput) -> ToolOutput {
        self.tools.execute(input).await
    }

    /// Release storage resources. Call once, after the last invocation.
    pub async fn shutdown(&self) {
        self.storage.close().await;
        info!("Application shut down");
    }
}

pub async fn open_storage(mode: &StorageMode) -> Result<Arc<dyn StorageBackend>> {
    match mode {
        StorageMode::File { data_dir } => {
            info!(data_dir = %data_dir.display(), "Using flat-file storage");
            Ok(Arc::new(FileStorage::new(data_dir.clone())?))
        }
        StorageMode::Sqlite { database_url } => {
            info!("Using SQLite storage");
            Ok(Arc::new(SqliteStorage::connect(database_url).await?))
        }
    }
}
