//! Durable, deduplicated priority queue of scrape targets backed by SQLite.
//!
//! Rows are unique by `(source, url)`. Dispatch claims rows with a single
//! `UPDATE ... RETURNING` statement so two concurrent callers can never claim
//! the same row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, SqlitePool};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::models::{DataCategory, NewQueueItem, NormalizedListing, QueueItem, QueueMetadata, QueueStatus, TargetKind};
use crate::store::ListingStore;
use crate::Result;

pub mod priority;

pub use priority::{compute_priority, PrioritySignals, DISCOVERY_PRIORITY};

#[derive(FromRow)]
struct QueueRow {
    id: i64,
    source: String,
    url: String,
    listing_id: Option<String>,
    priority: i64,
    attempts: i64,
    last_attempt_at: Option<DateTime<Utc>>,
    status: QueueStatus,
    data_needed: Json<Vec<DataCategory>>,
    metadata: Json<QueueMetadata>,
    last_error: Option<String>,
    result: Option<Json<serde_json::Value>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<QueueRow> for QueueItem {
    fn from(row: QueueRow) -> Self {
        QueueItem {
            id: row.id,
            source: row.source,
            url: row.url,
            listing_id: row.listing_id,
            priority: row.priority,
            attempts: row.attempts.max(0) as u32,
            last_attempt_at: row.last_attempt_at,
            status: row.status,
            data_needed: row.data_needed.0,
            metadata: row.metadata.0,
            last_error: row.last_error,
            result: row.result.map(|r| r.0),
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    /// Rows in `processing` whose last dispatch is older than the stuck threshold.
    pub stuck_processing: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }

    /// Share of finished rows that ended in terminal failure.
    pub fn failure_ratio(&self) -> f64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            0.0
        } else {
            self.failed as f64 / finished as f64
        }
    }
}

pub struct WorkQueue {
    pool: SqlitePool,
    config: QueueConfig,
    source_weights: HashMap<String, i64>,
}

impl WorkQueue {
    pub fn new(pool: SqlitePool, config: QueueConfig, source_weights: HashMap<String, i64>) -> Self {
        Self {
            pool,
            config,
            source_weights,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn priority_for(&self, item: &NewQueueItem) -> i64 {
        if let Some(priority) = item.priority {
            return priority;
        }
        match item.metadata.kind {
            TargetKind::Discovery => DISCOVERY_PRIORITY,
            TargetKind::Detail => compute_priority(PrioritySignals {
                never_seen: item.listing_id.is_none(),
                source_weight: self.source_weights.get(&item.source).copied().unwrap_or(0),
                missing_categories: item.data_needed.len(),
            }),
        }
    }

    /// Insert new targets or merge them into existing rows.
    ///
    /// An existing `(source, url)` row keeps the higher of the two priorities.
    /// Completed rows are reset to `pending` with a fresh attempt budget.
    /// Failed rows are reopened the same way only once their last attempt is
    /// older than `rescan_after_hours`. Rows currently being processed keep
    /// their status. Invalid items are skipped. Returns the number of rows
    /// written.
    pub async fn enqueue(&self, items: Vec<NewQueueItem>) -> Result<usize> {
        if items.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let reopen_failed_before = now - chrono::Duration::hours(self.config.rescan_after_hours as i64);
        let sql = enqueue_sql();
        let mut tx = self.pool.begin().await?;
        let mut written = 0;

        for item in &items {
            if let Err(e) = item.validate() {
                warn!(source = %item.source, url = %item.url, error = %e, "Skipping invalid queue item");
                continue;
            }

            let result = sqlx::query(&sql)
            .bind(&item.source)
            .bind(&item.url)
            .bind(&item.listing_id)
            .bind(self.priority_for(item))
            .bind(Json(&item.data_needed))
            .bind(Json(&item.metadata))
            .bind(now)
            .bind(reopen_failed_before)
            .execute(&mut *tx)
            .await?;

            written += result.rows_affected() as usize;
        }

        tx.commit().await?;
        metrics::counter!("rentwatch_queue_enqueued_total").increment(written as u64);
        debug!(submitted = items.len(), written, "Enqueued scrape targets");
        Ok(written)
    }

    /// Claim up to `limit` eligible rows, flipping them to `processing`.
    async fn claim(&self, source: Option<&str>, limit: usize) -> Result<Vec<QueueItem>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let retry_cutoff = now - chrono::Duration::seconds(self.config.retry_delay_secs as i64);
        let rows: Vec<QueueRow> = sqlx::query_as(
            r#"
            UPDATE queue_items
            SET status = 'processing', last_attempt_at = ?1, updated_at = ?1
            WHERE id IN (
                SELECT id FROM queue_items
                WHERE status = 'pending' AND attempts < ?2
                  AND (last_attempt_at IS NULL OR last_attempt_at <= ?3)
                  AND (?4 IS NULL OR source = ?4)
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT ?5
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(self.config.max_retries as i64)
        .bind(retry_cutoff)
        .bind(source)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        // RETURNING does not preserve the subquery order
        let mut items: Vec<QueueItem> = rows.into_iter().map(QueueItem::from).collect();
        items.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(items)
    }

    /// Claim the highest priority eligible rows, optionally for one source only.
    pub async fn next_batch(&self, source_filter: Option<&str>) -> Result<Vec<QueueItem>> {
        let items = self.claim(source_filter, self.config.batch_size).await?;
        if !items.is_empty() {
            debug!(count = items.len(), source = ?source_filter, "Claimed queue batch");
        }
        Ok(items)
    }

    /// Claim a batch grouped by source, giving every source with eligible work
    /// at most `batch_size / source_count` rows (at least one).
    ///
    /// Sources are served in order of their best pending priority; capacity a
    /// source leaves unused is not handed to the others.
    pub async fn by_fair_share(&self) -> Result<HashMap<String, Vec<QueueItem>>> {
        let now = Utc::now();
        let retry_cutoff = now - chrono::Duration::seconds(self.config.retry_delay_secs as i64);
        let sources: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT source FROM queue_items
            WHERE status = 'pending' AND attempts < ?1
              AND (last_attempt_at IS NULL OR last_attempt_at <= ?2)
            GROUP BY source
            ORDER BY MAX(priority) DESC, source ASC
            "#,
        )
        .bind(self.config.max_retries as i64)
        .bind(retry_cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut batches = HashMap::new();
        if sources.is_empty() || self.config.batch_size == 0 {
            return Ok(batches);
        }

        let share = (self.config.batch_size / sources.len()).max(1);
        let mut claimed = 0;
        for (source,) in sources {
            let remaining = self.config.batch_size - claimed;
            if remaining == 0 {
                break;
            }
            let items = self.claim(Some(&source), share.min(remaining)).await?;
            if items.is_empty() {
                continue;
            }
            claimed += items.len();
            batches.insert(source, items);
        }

        debug!(sources = batches.len(), claimed, share, "Claimed fair-share batch");
        Ok(batches)
    }

    /// Finish a claimed row. Returns false if the row was not in `processing`.
    pub async fn mark_completed(&self, id: i64, result: Option<serde_json::Value>) -> Result<bool> {
        let now = Utc::now();
        let updated = sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'completed', result = ?1, last_error = NULL, completed_at = ?2, updated_at = ?2
            WHERE id = ?3 AND status = 'processing'
            "#,
        )
        .bind(result.map(Json))
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() > 0)
    }

    /// Record a failed attempt.
    ///
    /// Returns the row's new status: `failed` once the attempt budget is spent,
    /// otherwise `pending` (eligible again after the retry delay). `None` when
    /// the row does not exist or is already finished.
    pub async fn mark_failed(&self, id: i64, error: &str) -> Result<Option<QueueStatus>> {
        let now = Utc::now();
        let status: Option<(QueueStatus,)> = sqlx::query_as(
            r#"
            UPDATE queue_items
            SET attempts = attempts + 1,
                status = CASE WHEN attempts + 1 >= ?1 THEN 'failed' ELSE 'pending' END,
                last_error = ?2,
                last_attempt_at = ?3,
                updated_at = ?3
            WHERE id = ?4 AND status IN ('pending', 'processing')
            RETURNING status
            "#,
        )
        .bind(self.config.max_retries as i64)
        .bind(error)
        .bind(now)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let status = status.map(|(s,)| s);
        if status == Some(QueueStatus::Failed) {
            warn!(item_id = id, error = %error, "Queue item exhausted its retries");
        }
        Ok(status)
    }

    /// Fail an item outright, whatever its remaining attempt budget. Used for
    /// errors that another attempt cannot fix. Charges the attempt that failed.
    pub async fn mark_failed_permanently(&self, id: i64, error: &str) -> Result<bool> {
        let now = Utc::now();
        let updated = sqlx::query(
            r#"
            UPDATE queue_items
            SET attempts = attempts + 1,
                status = 'failed',
                last_error = ?1,
                last_attempt_at = ?2,
                updated_at = ?2
            WHERE id = ?3 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated > 0 {
            warn!(item_id = id, error = %error, "Queue item failed permanently");
        }
        Ok(updated > 0)
    }

    /// Return every `processing` row to `pending` without charging an attempt.
    /// Used when dispatching stops with work still claimed.
    pub async fn release_in_flight(&self) -> Result<u64> {
        let released = sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'pending', last_attempt_at = NULL, updated_at = ?1
            WHERE status = 'processing'
            "#,
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if released > 0 {
            info!(released, "Returned in-flight queue items to pending");
        }
        Ok(released)
    }

    pub async fn get(&self, id: i64) -> Result<Option<QueueItem>> {
        let row: Option<QueueRow> = sqlx::query_as("SELECT * FROM queue_items WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(QueueItem::from))
    }

    pub async fn find(&self, source: &str, url: &str) -> Result<Option<QueueItem>> {
        let row: Option<QueueRow> = sqlx::query_as("SELECT * FROM queue_items WHERE source = ?1 AND url = ?2")
            .bind(source)
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(QueueItem::from))
    }

    /// Delete completed rows finished more than `retention_days` ago.
    pub async fn cleanup(&self, retention_days: u32) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
        let deleted = sqlx::query("DELETE FROM queue_items WHERE status = 'completed' AND completed_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if deleted > 0 {
            info!(deleted, retention_days, "Purged completed queue items");
        }
        Ok(deleted)
    }

    /// Queue a refresh for active listings not scraped within `stale_after_hours`.
    pub async fn reenqueue_stale(&self, listings: &dyn ListingStore) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::hours(self.config.stale_after_hours as i64);
        let stale = listings.find_stale(cutoff, self.config.rescan_limit).await?;
        let count = self.enqueue(stale.iter().map(refresh_target).collect()).await?;
        if count > 0 {
            info!(count, "Re-enqueued stale listings");
        }
        Ok(count)
    }

    /// Queue another scrape for active listings that are missing data and were
    /// last scraped more than `rescan_after_hours` ago.
    pub async fn reenqueue_incomplete(&self, listings: &dyn ListingStore) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::hours(self.config.rescan_after_hours as i64);
        let incomplete = listings.find_incomplete(cutoff, self.config.rescan_limit).await?;
        let count = self.enqueue(incomplete.iter().map(refresh_target).collect()).await?;
        if count > 0 {
            info!(count, "Re-enqueued incomplete listings");
        }
        Ok(count)
    }

    /// Row counts per status. Rows dispatched longer than `stuck_after` ago and
    /// still `processing` are also counted as stuck.
    pub async fn stats(&self, stuck_after: Duration) -> Result<QueueStats> {
        let stuck_cutoff = Utc::now() - chrono::Duration::seconds(stuck_after.as_secs() as i64);
        let (pending, processing, completed, failed, stuck): (i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN status = 'processing' THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN status = 'processing' AND last_attempt_at < ?1 THEN 1 ELSE 0 END), 0)
            FROM queue_items
            "#,
        )
        .bind(stuck_cutoff)
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            pending: pending.max(0) as u64,
            processing: processing.max(0) as u64,
            completed: completed.max(0) as u64,
            failed: failed.max(0) as u64,
            stuck_processing: stuck.max(0) as u64,
        })
    }
}

/// Upsert used by `enqueue`. `?8` is the cutoff before which a failed row's
/// last attempt must lie for the row to be reopened.
fn enqueue_sql() -> String {
    let reopen = "(queue_items.status = 'completed' OR (queue_items.status = 'failed' \
                  AND COALESCE(queue_items.last_attempt_at, queue_items.updated_at) < ?8))";
    format!(
        r#"
        INSERT INTO queue_items (source, url, listing_id, priority, attempts, status,
                                 data_needed, metadata, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, 0, 'pending', ?5, ?6, ?7, ?7)
        ON CONFLICT (source, url) DO UPDATE SET
            priority = MAX(queue_items.priority, excluded.priority),
            listing_id = COALESCE(excluded.listing_id, queue_items.listing_id),
            data_needed = excluded.data_needed,
            metadata = excluded.metadata,
            updated_at = excluded.updated_at,
            attempts = CASE WHEN {reopen} THEN 0 ELSE queue_items.attempts END,
            last_attempt_at = CASE WHEN {reopen} THEN NULL ELSE queue_items.last_attempt_at END,
            last_error = CASE WHEN {reopen} THEN NULL ELSE queue_items.last_error END,
            completed_at = CASE WHEN {reopen} THEN NULL ELSE queue_items.completed_at END,
            status = CASE WHEN {reopen} THEN 'pending' ELSE queue_items.status END
        "#,
        reopen = reopen
    )
}

fn refresh_target(listing: &NormalizedListing) -> NewQueueItem {
    NewQueueItem::detail(&listing.source, &listing.url)
        .with_listing(&listing.id)
        .with_external_id(&listing.external_id)
        .with_data_needed(listing.missing_categories())
}
