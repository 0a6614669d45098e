//! Item registry
//!
//! Registers linked items with their sealed access credential, hands out
//! unsealed credentials to the engine, and re-seals stored credentials when
//! the vault's active key changes.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::models::{Item, ItemStatus};
use crate::storage::StorageBackend;
use crate::vault::{AccessToken, Vault};
use crate::Result;

/// Item summary safe to hand to callers (no credential material)
#[derive(Debug, Clone, Serialize)]
pub struct ItemSummary {
    pub item_id: String,
    pub status: ItemStatus,
    pub institution_name: Option<String>,
    pub key_version: u32,
    pub created_at: chrono::DateTime<Utc>,
    pub updated_at: chrono::DateTime<Utc>,
}

impl From<&Item> for ItemSummary {
    fn from(item: &Item) -> Self {
        Self {
            item_id: item.item_id.clone(),
            status: item.status,
            institution_name: item.institution_name.clone(),
            key_version: item.credential.key_version,
            created_at: item.created_at,
            updated_at: item.updated_at,
        }
    }
}

pub struct ItemRegistry {
    storage: Arc<dyn StorageBackend>,
    vault: Arc<Vault>,
}

impl ItemRegistry {
    pub fn new(storage: Arc<dyn StorageBackend>, vault: Arc<Vault>) -> Self {
        Self { storage, vault }
    }

    /// Store (or replace) an item's credential, sealed under the active key.
    pub async fn register(
        &self,
        item_id: &str,
        token: &AccessToken,
        institution_name: Option<String>,
    ) -> Result<ItemSummary> {
        if item_id.trim().is_empty() {
            return Err(EngineError::InvalidToolInput(
                "item_id must not be empty".to_string(),
            ));
        }
        if token.expose().trim().is_empty() {
            return Err(EngineError::InvalidToolInput(
                "access_token must not be empty".to_string(),
            ));
        }

        let now = Utc::now();
        let created_at = match self.storage.get_item(item_id).await {
            Ok(existing) => existing.created_at,
            Err(EngineError::ItemNotFound(_)) => now,
            Err(e) => return Err(e),
        };

        let item = Item {
            item_id: item_id.to_string(),
            credential: self.vault.seal(token)?,
            status: ItemStatus::Unknown,
            institution_name,
            created_at,
            updated_at: now,
        };
        self.storage.put_item(&item).await?;

        info!(item_id, key_version = item.credential.key_version, "Item registered");
        Ok(ItemSummary::from(&item))
    }

    /// Delete an item and everything stored for it.
    pub async fn remove(&self, item_id: &str) -> Result<()> {
        self.storage.delete_item(item_id).await?;
        info!(item_id, "Item removed");
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<ItemSummary>> {
        let items = self.storage.list_items().await?;
        Ok(items.iter().map(ItemSummary::from).collect())
    }

    /// Load an item and unseal its credential.
    pub async fn credential(&self, item_id: &str) -> Result<(Item, AccessToken)> {
        let item = self.storage.get_item(item_id).await?;
        let token = self.vault.unseal(&item.credential).map_err(|e| {
            warn!(item_id, key_version = item.credential.key_version, "Credential failed to unseal");
            e
        })?;
        Ok((item, token))
    }

    pub async fn set_status(&self, item_id: &str, status: ItemStatus) -> Result<()> {
        self.storage.set_item_status(item_id, status).await
    }

    /// Re-seal every credential not sealed under the active key.
    /// Returns how many items were rotated.
    pub async fn rotate_credentials(&self) -> Result<usize> {
        let mut rotated = 0;
        for item in self.storage.list_items().await? {
            if !self.vault.needs_rotation(&item.credential) {
                continue;
            }
            let resealed = self.vault.reseal(&item.credential)?;
            let swapped = self
                .storage
                .replace_credential(&item.item_id, &item.credential, &resealed)
                .await?;
            if !swapped {
                // Removed or re-registered since the listing.
                debug!(item_id = %item.item_id, "Credential changed during rotation, skipped");
                continue;
            }
            info!(
                item_id = %item.item_id,
                from_version = item.credential.key_version,
                to_version = resealed.key_version,
                "Credential re-sealed"
            );
            rotated += 1;
        }
        Ok(rotated)
    }
}
