//! The per-source half of an update cycle: one leased session, items in order.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use super::CoordinatorInner;
use crate::adapters::registry::normalize_detail;
use crate::adapters::SourceAdapter;
use crate::browser::PageUnit;
use crate::models::{NormalizedListing, QueueItem, TargetKind};
use crate::pool::SessionLease;
use crate::utils::error::AppError;
use crate::Result;

/// What one source group contributed to an update cycle.
#[derive(Debug, Default)]
pub(crate) struct SourceOutcome {
    pub processed: usize,
    pub failed: usize,
    pub updated: usize,
    pub discovered: usize,
    pub new_listings: Vec<NormalizedListing>,
}

enum ItemOutcome {
    Discovered { found: usize, enqueued: usize },
    Stored { listing: NormalizedListing, inserted: bool },
}

impl ItemOutcome {
    fn summary(&self) -> serde_json::Value {
        match self {
            ItemOutcome::Discovered { found, enqueued } => serde_json::json!({
                "kind": TargetKind::Discovery,
                "found": found,
                "enqueued": enqueued,
            }),
            ItemOutcome::Stored { listing, inserted } => serde_json::json!({
                "kind": TargetKind::Detail,
                "listing_id": listing.id,
                "inserted": inserted,
                "active": listing.is_active,
            }),
        }
    }
}

impl CoordinatorInner {
    /// Process one source's share of the batch. Never fails: every error is
    /// recorded on the affected queue rows and in the error buffer.
    pub(crate) async fn process_source(&self, source: &str, items: Vec<QueueItem>) -> SourceOutcome {
        let mut outcome = SourceOutcome::default();

        let Some(adapter) = self.adapters.get(source).cloned() else {
            let error = AppError::Configuration(format!("No enabled adapter for source '{}'", source));
            self.fail_items(source, &items, &error, &mut outcome).await;
            return outcome;
        };

        let priority = items
            .iter()
            .map(|item| item.priority)
            .max()
            .unwrap_or(0)
            .clamp(i32::MIN as i64, i32::MAX as i64) as i32;
        let requires_auth = self.requires_auth(source, adapter.as_ref());

        let lease = match self
            .pool
            .acquire(source, requires_auth, priority, self.pool.config().acquire_timeout())
            .await
        {
            Ok(lease) => lease,
            Err(e) => {
                warn!(source = %source, error = %e, "Could not acquire a session");
                self.fail_items(source, &items, &e, &mut outcome).await;
                return outcome;
            }
        };

        if requires_auth && !lease.is_authenticated {
            if let Err(e) = self.authenticate(source, adapter.as_ref(), &lease).await {
                warn!(source = %source, session_id = %lease.session_id, error = %e, "Authentication failed");
                self.fail_items(source, &items, &e, &mut outcome).await;
                self.pool.release(lease).await;
                return outcome;
            }
        }

        let delay = self
            .sources
            .get(source)
            .map(|s| s.request_delay())
            .unwrap_or_default();

        for (index, item) in items.iter().enumerate() {
            if index > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.run_item(adapter.as_ref(), lease.unit(), item, &mut outcome).await;
        }

        self.pool.release(lease).await;

        info!(
            source = %source,
            processed = outcome.processed,
            failed = outcome.failed,
            new = outcome.new_listings.len(),
            updated = outcome.updated,
            "Processed source batch"
        );
        outcome
    }

    fn requires_auth(&self, source: &str, adapter: &dyn SourceAdapter) -> bool {
        adapter.requires_auth() || self.sources.get(source).is_some_and(|s| s.requires_auth)
    }

    async fn authenticate(&self, source: &str, adapter: &dyn SourceAdapter, lease: &SessionLease) -> Result<()> {
        let credentials = self.sources.get(source).and_then(|s| s.credentials.as_ref());
        let succeeded = match adapter.authenticate(lease.unit(), credentials).await {
            Ok(succeeded) => succeeded,
            Err(e) => {
                return Err(AppError::Authentication {
                    source_id: source.to_string(),
                    message: e.to_string(),
                });
            }
        };

        if !succeeded {
            return Err(AppError::Authentication {
                source_id: source.to_string(),
                message: "adapter rejected the login".to_string(),
            });
        }

        let metadata = serde_json::json!({
            "source": source,
            "username": credentials.map(|c| c.username.clone()),
        });
        self.pool.mark_authenticated(&lease.session_id, Some(metadata)).await?;
        debug!(source = %source, session_id = %lease.session_id, "Session logged in");
        Ok(())
    }

    async fn run_item(&self, adapter: &dyn SourceAdapter, unit: &dyn PageUnit, item: &QueueItem, outcome: &mut SourceOutcome) {
        let deadline = self.config.item_timeout() * 2;
        let result = match tokio::time::timeout(deadline, self.process_item(adapter, unit, item)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::TransientFetch(format!(
                "Processing {} exceeded {:?}",
                item.url, deadline
            ))),
        };

        match result {
            Ok(done) => {
                outcome.processed += 1;
                match &done {
                    ItemOutcome::Discovered { enqueued, .. } => outcome.discovered += enqueued,
                    ItemOutcome::Stored { inserted: false, .. } => outcome.updated += 1,
                    ItemOutcome::Stored { .. } => {}
                }

                if let Err(e) = self.queue.mark_completed(item.id, Some(done.summary())).await {
                    self.record_error(Some(&item.source), Some(item.id), &e).await;
                }
                if let ItemOutcome::Stored { listing, inserted: true } = done {
                    outcome.new_listings.push(listing);
                }
                metrics::counter!("rentwatch_items_processed_total", "source" => item.source.clone(), "outcome" => "completed")
                    .increment(1);
            }
            Err(e) => {
                debug!(source = %item.source, item_id = item.id, url = %item.url, error = %e, "Queue item failed");
                self.fail_items(&item.source, std::slice::from_ref(item), &e, outcome).await;
            }
        }
    }

    async fn process_item(&self, adapter: &dyn SourceAdapter, unit: &dyn PageUnit, item: &QueueItem) -> Result<ItemOutcome> {
        unit.navigate(&item.url, self.config.item_timeout()).await?;

        if adapter.detect_blocked(unit).await? {
            return Err(AppError::Blocked {
                source_id: item.source.clone(),
                url: item.url.clone(),
            });
        }

        match item.kind() {
            TargetKind::Discovery => {
                let targets = adapter.extract_targets_from_listing_page(unit).await?;
                let found = targets.len();
                let new_items = targets
                    .into_iter()
                    .map(|target| target.into_queue_item(&item.source))
                    .collect();
                let enqueued = self.queue.enqueue(new_items).await?;
                debug!(source = %item.source, url = %item.url, found, enqueued, "Discovered targets");
                Ok(ItemOutcome::Discovered { found, enqueued })
            }
            TargetKind::Detail => {
                let detail = adapter.extract_detail(unit, &item.url).await?;
                let mut listing = normalize_detail(adapter, detail)?;
                let stored = self.listings.upsert_listing(&listing).await?;
                listing.id = stored.listing_id;
                Ok(ItemOutcome::Stored {
                    listing,
                    inserted: stored.inserted,
                })
            }
        }
    }

    /// Charge one failed attempt to each item and record the error. Errors
    /// that cannot clear on retry fail the items outright.
    async fn fail_items(&self, source: &str, items: &[QueueItem], error: &AppError, outcome: &mut SourceOutcome) {
        let message = error.to_string();
        let retryable = error.is_retryable();
        for item in items {
            outcome.failed += 1;
            let marked = if retryable {
                self.queue.mark_failed(item.id, &message).await.map(|_| ())
            } else {
                self.queue.mark_failed_permanently(item.id, &message).await.map(|_| ())
            };
            if let Err(e) = marked {
                self.record_error(Some(source), Some(item.id), &e).await;
            }
            self.record_error(Some(source), Some(item.id), error).await;
        }
        metrics::counter!("rentwatch_items_processed_total", "source" => source.to_string(), "outcome" => error.kind())
            .increment(items.len() as u64);
    }
}

/// Holds the overlap flag for the lifetime of one update cycle.
pub(crate) struct CycleGuard<'a>(&'a AtomicBool);

impl<'a> CycleGuard<'a> {
    pub fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CycleGuard(flag))
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
