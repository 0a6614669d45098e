//! Transaction reconciler - cursor-based sync loop
//!
//! START → FETCHING → MERGING → ADVANCING → (FETCHING while has_more) → DONE
//!
//! A page's delta and the cursor advance are committed together through
//! `StorageBackend::commit_sync_page`, so a failure at any point leaves the
//! stored cursor on the last fully merged page.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregator::{Aggregator, SyncPage};
use crate::credentials::ItemRegistry;
use crate::error::EngineError;
use crate::models::{CursorUpdate, ItemStatus, SyncOutcome};
use crate::retry::RetryPolicy;
use crate::storage::StorageBackend;
use crate::Result;

pub const DEFAULT_MAX_PAGES: u32 = 10;
pub const DEFAULT_DAYS_REQUESTED: u32 = 90;
pub const MAX_DAYS_REQUESTED: u32 = 730;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Start,
    Fetching,
    Merging,
    Advancing,
    Done,
    Failed,
}

/// Parameters of one sync invocation
#[derive(Debug, Clone, Deserialize)]
pub struct SyncRequest {
    pub item_id: String,
    #[serde(default)]
    pub force_refresh: bool,
    #[serde(default = "default_days_requested")]
    pub days_requested: u32,
}

fn default_days_requested() -> u32 {
    DEFAULT_DAYS_REQUESTED
}

impl SyncRequest {
    pub fn new(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            force_refresh: false,
            days_requested: DEFAULT_DAYS_REQUESTED,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.item_id.trim().is_empty() {
            return Err(EngineError::InvalidToolInput(
                "item_id must not be empty".to_string(),
            ));
        }
        if !(1..=MAX_DAYS_REQUESTED).contains(&self.days_requested) {
            return Err(EngineError::InvalidToolInput(format!(
                "days_requested must be between 1 and {}, got {}",
                MAX_DAYS_REQUESTED, self.days_requested
            )));
        }
        Ok(())
    }
}

/// Outcome of a sync invocation.
///
/// Counts are the records the aggregator delivered across the pages
/// committed by this invocation.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SyncResult {
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
    pub next_cursor: String,
    pub has_more: bool,
    pub item_status: ItemStatus,
    pub pages: u32,
    pub summary: String,
}

/// Human-readable one-liner, e.g. "Added 2, Modified 1, Removed 1 transactions".
pub fn summarize(added: usize, modified: usize, removed: usize) -> String {
    let mut parts = Vec::new();
    if added > 0 {
        parts.push(format!("Added {}", added));
    }
    if modified > 0 {
        parts.push(format!("Modified {}", modified));
    }
    if removed > 0 {
        parts.push(format!("Removed {}", removed));
    }

    if parts.is_empty() {
        "No changes".to_string()
    } else {
        format!("{} transactions", parts.join(", "))
    }
}

/// Reject pages that would corrupt storage or the cursor.
pub fn validate_page(page: &SyncPage) -> Result<()> {
    let mut seen = HashSet::new();
    for txn in page.added.iter().chain(page.modified.iter()) {
        if txn.transaction_id.is_empty() {
            return Err(EngineError::Validation(
                "transaction without an id".to_string(),
            ));
        }
        if !seen.insert(txn.transaction_id.as_str()) {
            return Err(EngineError::Validation(format!(
                "transaction {} appears more than once in a page",
                txn.transaction_id
            )));
        }
    }

    let mut removed = HashSet::new();
    for id in &page.removed {
        if id.is_empty() {
            return Err(EngineError::Validation(
                "removed entry without an id".to_string(),
            ));
        }
        if !removed.insert(id.as_str()) {
            return Err(EngineError::Validation(format!(
                "transaction {} removed more than once in a page",
                id
            )));
        }
    }

    if page.next_cursor.is_empty() {
        return Err(EngineError::Validation(if page.has_more {
            "page has more data but no next cursor".to_string()
        } else {
            "page has no next cursor".to_string()
        }));
    }

    Ok(())
}

#[derive(Default)]
struct Totals {
    added: usize,
    modified: usize,
    removed: usize,
}

pub struct Reconciler {
    registry: Arc<ItemRegistry>,
    storage: Arc<dyn StorageBackend>,
    aggregator: Arc<dyn Aggregator>,
    retry: RetryPolicy,
    max_pages: u32,
}

impl Reconciler {
    pub fn new(
        registry: Arc<ItemRegistry>,
        storage: Arc<dyn StorageBackend>,
        aggregator: Arc<dyn Aggregator>,
        retry: RetryPolicy,
        max_pages: u32,
    ) -> Self {
        Self {
            registry,
            storage,
            aggregator,
            retry,
            max_pages: max_pages.max(1),
        }
    }

    /// Run one sync invocation for an item.
    pub async fn sync(&self, request: &SyncRequest) -> Result<SyncResult> {
        request.validate()?;

        let start_time = Instant::now();
        let run_id = Uuid::new_v4();
        let mut phase = SyncPhase::Start;

        info!(
            %run_id,
            item_id = %request.item_id,
            force_refresh = request.force_refresh,
            "Reconciler: starting sync"
        );

        match self.run(request, &mut phase).await {
            Ok(result) => {
                info!(
                    %run_id,
                    item_id = %request.item_id,
                    pages = result.pages,
                    added = result.added,
                    modified = result.modified,
                    removed = result.removed,
                    has_more = result.has_more,
                    elapsed_ms = start_time.elapsed().as_millis() as u64,
                    "Sync complete"
                );
                Ok(result)
            }
            Err(err) => {
                let failed_in = phase;
                phase = SyncPhase::Failed;
                warn!(
                    %run_id,
                    item_id = %request.item_id,
                    phase = ?phase,
                    failed_in = ?failed_in,
                    error = %err,
                    "Sync failed"
                );
                self.record_failure(&request.item_id, &err).await;
                Err(err)
            }
        }
    }

    async fn run(&self, request: &SyncRequest, phase: &mut SyncPhase) -> Result<SyncResult> {
        let item_id = request.item_id.as_str();

        // === START ===
        let (item, token) = self.registry.credential(item_id).await?;
        let stored = self.storage.get_cursor(item_id).await?;
        let mut has_more = stored.as_ref().map_or(false, |c| c.has_more);
        let mut cursor = stored.map(|c| c.cursor);

        debug!(item_id, has_cursor = cursor.is_some(), "Loaded sync cursor");

        // === FETCHING (upstream refresh, best-effort) ===
        *phase = SyncPhase::Fetching;
        if request.force_refresh {
            match self.aggregator.refresh(&token).await {
                Ok(status) if status.accepted => {
                    info!(item_id, "Upstream refresh requested");
                }
                Ok(_) => {
                    warn!(item_id, "Upstream refresh was not accepted, syncing anyway");
                }
                Err(e) => {
                    warn!(item_id, error = %e, "Upstream refresh failed, syncing anyway");
                }
            }
        }

        let mut totals = Totals::default();
        let mut pages = 0;

        while pages < self.max_pages {
            pages += 1;

            // === FETCHING ===
            *phase = SyncPhase::Fetching;
            let days = if cursor.is_none() {
                Some(request.days_requested)
            } else {
                None
            };
            let page = self
                .retry
                .run("transactions_sync", || {
                    self.aggregator
                        .sync_transactions_page(&token, cursor.as_deref(), days)
                })
                .await?;

            // === MERGING ===
            *phase = SyncPhase::Merging;
            validate_page(&page)?;
            let delivered = (page.added.len(), page.modified.len(), page.removed.len());
            let (delta, next_cursor, page_has_more) = page.into_parts();
            let update = CursorUpdate {
                cursor: next_cursor,
                has_more: page_has_more,
                outcome: if page_has_more {
                    SyncOutcome::Partial
                } else {
                    SyncOutcome::Complete
                },
            };

            // === ADVANCING ===
            *phase = SyncPhase::Advancing;
            match self
                .storage
                .commit_sync_page(item_id, cursor.as_deref(), &delta, &update)
                .await
            {
                Ok(applied) => {
                    totals.added += delivered.0;
                    totals.modified += delivered.1;
                    totals.removed += delivered.2;
                    debug!(
                        item_id,
                        page = pages,
                        applied_added = applied.added,
                        applied_modified = applied.modified,
                        applied_removed = applied.removed,
                        skipped = applied.skipped,
                        "Page committed"
                    );
                    cursor = Some(update.cursor);
                    has_more = update.has_more;
                }
                Err(EngineError::CursorConflict(_)) => {
                    warn!(item_id, page = pages, "Cursor advanced concurrently, reloading");
                    let reloaded = self.storage.get_cursor(item_id).await?;
                    has_more = reloaded.as_ref().map_or(true, |c| c.has_more);
                    cursor = reloaded.map(|c| c.cursor);
                }
                Err(e) => return Err(e),
            }

            if !has_more {
                break;
            }
        }

        if has_more {
            info!(item_id, pages, "Page limit reached, more data remains upstream");
        }

        // === DONE ===
        *phase = SyncPhase::Done;
        if item.status != ItemStatus::Healthy {
            self.registry.set_status(item_id, ItemStatus::Healthy).await?;
        }

        Ok(SyncResult {
            added: totals.added,
            modified: totals.modified,
            removed: totals.removed,
            next_cursor: cursor.unwrap_or_default(),
            has_more,
            item_status: ItemStatus::Healthy,
            pages,
            summary: summarize(totals.added, totals.modified, totals.removed),
        })
    }

    /// Reflect aggregator-reported credential problems on the item.
    async fn record_failure(&self, item_id: &str, err: &EngineError) {
        let status = if err.requires_relink() {
            ItemStatus::LoginRequired
        } else if matches!(err, EngineError::Integrity(_)) {
            ItemStatus::Error
        } else {
            return;
        };

        if let Err(e) = self.registry.set_status(item_id, status).await {
            warn!(item_id, error = %e, "Failed to record item status");
        }
    }
}
