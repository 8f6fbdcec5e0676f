//! Drives discovery, update and health cycles over the queue and the pool.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{debug, error, info, warn};

use crate::adapters::{AdapterRegistry, SourceAdapter};
use crate::config::{AppConfig, CoordinatorConfig, QueueConfig, SourceConfig};
use crate::events::{CrawlEvent, EventBus};
use crate::matching::{MatchEngine, MatchStats};
use crate::models::NewQueueItem;
use crate::pool::ResourcePool;
use crate::queue::{WorkQueue, DISCOVERY_PRIORITY};
use crate::store::ListingStore;
use crate::utils::error::AppError;
use crate::Result;

pub mod errors;
pub mod health;
mod update;

pub use errors::{CycleError, MAX_RECENT_ERRORS};
pub use health::{HealthReport, HealthSnapshot};

use errors::ErrorBuffer;
use update::{CycleGuard, SourceOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinatorState {
    Stopped,
    Running,
}

/// Running totals since the coordinator was built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorStats {
    pub discovery_cycles: u64,
    pub update_cycles: u64,
    pub skipped_updates: u64,
    pub health_checks: u64,
    pub items_processed: u64,
    pub items_failed: u64,
    pub listings_new: u64,
    pub listings_updated: u64,
    pub matches_created: u64,
    pub errors_recorded: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_discovery_at: Option<DateTime<Utc>>,
    pub last_update_at: Option<DateTime<Utc>>,
    pub last_health_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryReport {
    pub sources: Vec<String>,
    pub enqueued: usize,
    pub duration: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateReport {
    /// Another update cycle was still running; nothing was done.
    pub skipped: bool,
    pub processed: usize,
    pub failed: usize,
    pub new: usize,
    pub updated: usize,
    pub discovered: usize,
    pub matches: Option<MatchStats>,
    pub duration: Duration,
}

/// Collaborators the coordinator drives. Built by the caller so they can be
/// shared with other components and swapped in tests.
pub struct CoordinatorDeps {
    pub queue: Arc<WorkQueue>,
    pub pool: Arc<ResourcePool>,
    pub listings: Arc<dyn ListingStore>,
    pub adapters: AdapterRegistry,
    pub match_engine: Arc<MatchEngine>,
    pub events: EventBus,
}

pub(crate) struct CoordinatorInner {
    config: CoordinatorConfig,
    queue_config: QueueConfig,
    /// Enabled sources in configuration order.
    source_order: Vec<String>,
    sources: HashMap<String, SourceConfig>,
    adapters: HashMap<String, Arc<dyn SourceAdapter>>,
    queue: Arc<WorkQueue>,
    pool: Arc<ResourcePool>,
    listings: Arc<dyn ListingStore>,
    match_engine: Arc<MatchEngine>,
    events: EventBus,
    stats: Mutex<CoordinatorStats>,
    errors: Mutex<ErrorBuffer>,
    update_running: AtomicBool,
    tasks: Mutex<JoinSet<()>>,
}

pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
    scheduler: Mutex<Option<JobScheduler>>,
}

#[derive(Debug, Clone, Copy)]
enum CycleKind {
    Discovery,
    Update,
    Health,
}

fn scheduler_error(e: JobSchedulerError) -> AppError {
    AppError::Internal(format!("Scheduler error: {}", e))
}

impl Coordinator {
    /// Validate the configuration and resolve an adapter for every enabled
    /// source. Any misconfiguration fails here, before anything runs.
    pub async fn new(config: &AppConfig, deps: CoordinatorDeps) -> Result<Self> {
        config
            .validate()
            .map_err(|e| AppError::Configuration(e.to_string()))?;

        let mut source_order = Vec::new();
        let mut sources = HashMap::new();
        let mut adapters = HashMap::new();
        for source in config.enabled_sources() {
            let adapter = deps.adapters.get(&source.id).await.ok_or_else(|| {
                AppError::Configuration(format!("No adapter registered for enabled source '{}'", source.id))
            })?;
            if adapter.requires_auth() && source.credentials.is_none() {
                return Err(AppError::Configuration(format!(
                    "Source '{}' requires authentication but has no credentials",
                    source.id
                )));
            }
            source_order.push(source.id.clone());
            sources.insert(source.id.clone(), source.clone());
            adapters.insert(source.id.clone(), adapter);
        }

        if source_order.is_empty() {
            warn!("No enabled sources configured");
        }

        let inner = CoordinatorInner {
            config: config.coordinator.clone(),
            queue_config: config.queue.clone(),
            source_order,
            sources,
            adapters,
            queue: deps.queue,
            pool: deps.pool,
            listings: deps.listings,
            match_engine: deps.match_engine,
            events: deps.events,
            stats: Mutex::new(CoordinatorStats::default()),
            errors: Mutex::new(ErrorBuffer::default()),
            update_running: AtomicBool::new(false),
            tasks: Mutex::new(JoinSet::new()),
        };

        Ok(Self {
            inner: Arc::new(inner),
            scheduler: Mutex::new(None),
        })
    }

    pub async fn state(&self) -> CoordinatorState {
        if self.scheduler.lock().await.is_some() {
            CoordinatorState::Running
        } else {
            CoordinatorState::Stopped
        }
    }

    /// Start the pool's maintenance task and the cycle timers.
    pub async fn start(&self) -> Result<()> {
        let mut slot = self.scheduler.lock().await;
        if slot.is_some() {
            warn!("Coordinator is already running");
            return Ok(());
        }

        self.inner.pool.reopen().await;
        self.inner.pool.start_maintenance().await;

        let config = &self.inner.config;
        let mut scheduler = JobScheduler::new().await.map_err(scheduler_error)?;
        if config.auto_discovery {
            self.add_job(&scheduler, CycleKind::Discovery, config.discovery_interval_minutes)
                .await?;
        }
        self.add_job(&scheduler, CycleKind::Update, config.update_interval_minutes)
            .await?;
        self.add_job(&scheduler, CycleKind::Health, config.health_interval_minutes)
            .await?;

        if let Err(e) = scheduler.start().await {
            let _ = scheduler.shutdown().await;
            return Err(scheduler_error(e));
        }
        *slot = Some(scheduler);

        self.inner.stats.lock().await.started_at = Some(Utc::now());

        info!(
            sources = self.inner.source_order.len(),
            discovery_minutes = config.discovery_interval_minutes,
            update_minutes = config.update_interval_minutes,
            health_minutes = config.health_interval_minutes,
            "Coordinator started"
        );
        self.inner.events.emit(CrawlEvent::Started { config: config.clone() });

        if config.auto_discovery {
            // don't wait a whole interval for the first search pages
            self.inner.spawn_cycle(CycleKind::Discovery).await;
        }
        Ok(())
    }

    async fn add_job(&self, scheduler: &JobScheduler, kind: CycleKind, interval_minutes: u64) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let job = Job::new_repeated_async(Duration::from_secs(interval_minutes * 60), move |_id, _scheduler| {
            let inner = Arc::clone(&inner);
            Box::pin(async move {
                inner.spawn_cycle(kind).await;
            })
        })
        .map_err(scheduler_error)?;

        scheduler.add(job).await.map_err(scheduler_error)?;
        debug!(cycle = ?kind, interval_minutes, "Scheduled cycle");
        Ok(())
    }

    /// Stop the timers, cancel cycles in flight, return their claimed queue
    /// rows to `pending` and close every pooled session.
    pub async fn stop(&self) -> Result<()> {
        let Some(mut scheduler) = self.scheduler.lock().await.take() else {
            debug!("Coordinator is not running");
            return Ok(());
        };

        if let Err(e) = scheduler.shutdown().await {
            warn!(error = %e, "Scheduler did not shut down cleanly");
        }
        self.inner.tasks.lock().await.shutdown().await;

        if let Err(e) = self.inner.queue.release_in_flight().await {
            self.inner.record_error(None, None, &e).await;
        }
        self.inner.pool.shutdown().await;

        let stats = self.inner.stats.lock().await.clone();
        info!(
            update_cycles = stats.update_cycles,
            items_processed = stats.items_processed,
            "Coordinator stopped"
        );
        self.inner.events.emit(CrawlEvent::Stopped { stats });
        Ok(())
    }

    pub async fn run_discovery_cycle(&self) -> Result<DiscoveryReport> {
        self.inner.run_discovery_cycle().await
    }

    pub async fn run_update_cycle(&self) -> Result<UpdateReport> {
        self.inner.run_update_cycle().await
    }

    pub async fn run_health_check(&self) -> Result<HealthReport> {
        self.inner.run_health_check().await
    }

    pub async fn stats(&self) -> CoordinatorStats {
        self.inner.stats.lock().await.clone()
    }

    /// Up to [`MAX_RECENT_ERRORS`] errors caught in cycles, oldest first.
    pub async fn recent_errors(&self) -> Vec<CycleError> {
        self.inner.errors.lock().await.snapshot()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<CrawlEvent> {
        self.inner.events.subscribe()
    }
}

impl CoordinatorInner {
    async fn spawn_cycle(self: &Arc<Self>, kind: CycleKind) {
        let inner = Arc::clone(self);
        let mut tasks = self.tasks.lock().await;
        // reap finished cycles so the set does not grow
        while let Some(Some(_)) = futures::FutureExt::now_or_never(tasks.join_next()) {}

        tasks.spawn(async move {
            let result = match kind {
                CycleKind::Discovery => inner.run_discovery_cycle().await.map(|_| ()),
                CycleKind::Update => inner.run_update_cycle().await.map(|_| ()),
                CycleKind::Health => inner.run_health_check().await.map(|_| ()),
            };
            if let Err(e) = result {
                error!(cycle = ?kind, error = %e, "Cycle failed");
                inner.record_error(None, None, &e).await;
            }
        });
    }

    pub(crate) async fn record_error(&self, source: Option<&str>, item_id: Option<i64>, error: &AppError) {
        self.errors.lock().await.push(CycleError::new(source, item_id, error));
        self.stats.lock().await.errors_recorded += 1;
    }

    /// Enqueue the first search results page of every enabled source.
    async fn run_discovery_cycle(&self) -> Result<DiscoveryReport> {
        let started = Instant::now();
        let mut items = Vec::new();
        let mut sources = Vec::new();

        for source_id in &self.source_order {
            let (Some(source), Some(adapter)) = (self.sources.get(source_id), self.adapters.get(source_id)) else {
                continue;
            };
            match adapter.build_search_target(&source.filters, 1) {
                Ok(url) => {
                    items.push(NewQueueItem::discovery(source_id, &url, 1).with_priority(DISCOVERY_PRIORITY));
                    sources.push(source_id.clone());
                }
                Err(e) => {
                    warn!(source = %source_id, error = %e, "Could not build search target");
                    self.record_error(Some(source_id), None, &e).await;
                }
            }
        }

        let enqueued = self.queue.enqueue(items).await?;
        let duration = started.elapsed();

        {
            let mut stats = self.stats.lock().await;
            stats.discovery_cycles += 1;
            stats.last_discovery_at = Some(Utc::now());
        }
        info!(sources = sources.len(), enqueued, ?duration, "Discovery cycle completed");
        self.events.emit(CrawlEvent::DiscoveryCompleted {
            sources: sources.clone(),
            duration,
        });

        Ok(DiscoveryReport {
            sources,
            enqueued,
            duration,
        })
    }

    /// Claim a fair-share batch and work through it, one task per source.
    async fn run_update_cycle(&self) -> Result<UpdateReport> {
        let Some(_guard) = CycleGuard::acquire(&self.update_running) else {
            debug!("Previous update cycle still running; skipping");
            self.stats.lock().await.skipped_updates += 1;
            return Ok(UpdateReport {
                skipped: true,
                ..Default::default()
            });
        };

        let started = Instant::now();
        let batches = self.queue.by_fair_share().await?;
        let concurrency = self.config.max_concurrent_sources.max(1);

        let outcomes: Vec<SourceOutcome> = stream::iter(batches)
            .map(|(source, items)| async move { self.process_source(&source, items).await })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut report = UpdateReport::default();
        let mut new_listings = Vec::new();
        for outcome in outcomes {
            report.processed += outcome.processed;
            report.failed += outcome.failed;
            report.updated += outcome.updated;
            report.discovered += outcome.discovered;
            new_listings.extend(outcome.new_listings);
        }
        report.new = new_listings.len();

        if self.config.auto_matching && !new_listings.is_empty() {
            match self.match_engine.create_matches(&new_listings).await {
                Ok(stats) => report.matches = Some(stats),
                Err(e) => {
                    warn!(error = %e, "Matching new listings failed");
                    self.record_error(None, None, &e).await;
                }
            }
        }

        if self.config.auto_cleanup {
            self.cleanup().await;
        }

        report.duration = started.elapsed();
        {
            let mut stats = self.stats.lock().await;
            stats.update_cycles += 1;
            stats.items_processed += report.processed as u64;
            stats.items_failed += report.failed as u64;
            stats.listings_new += report.new as u64;
            stats.listings_updated += report.updated as u64;
            stats.matches_created += report.matches.as_ref().map_or(0, |m| m.persisted as u64);
            stats.last_update_at = Some(Utc::now());
        }

        metrics::histogram!("rentwatch_update_cycle_seconds").record(report.duration.as_secs_f64());
        info!(
            processed = report.processed,
            failed = report.failed,
            new = report.new,
            updated = report.updated,
            duration = ?report.duration,
            "Update cycle completed"
        );
        self.events.emit(CrawlEvent::UpdateCompleted {
            processed: report.processed,
            new: report.new,
            updated: report.updated,
            duration: report.duration,
        });
        Ok(report)
    }

    async fn cleanup(&self) {
        if let Err(e) = self.queue.cleanup(self.queue_config.retention_days).await {
            self.record_error(None, None, &e).await;
        }
        if let Err(e) = self.queue.reenqueue_stale(self.listings.as_ref()).await {
            self.record_error(None, None, &e).await;
        }
        if let Err(e) = self.queue.reenqueue_incomplete(self.listings.as_ref()).await {
            self.record_error(None, None, &e).await;
        }
    }

    /// Compare queue and pool statistics against thresholds and emit a warning
    /// event for each one crossed.
    async fn run_health_check(&self) -> Result<HealthReport> {
        let queue = self
            .queue
            .stats(Duration::from_secs(self.config.stuck_after_minutes * 60))
            .await?;
        let pool = self.pool.get_stats().await;

        let snapshot = HealthSnapshot {
            checked_at: Utc::now(),
            failure_ratio: queue.failure_ratio(),
            queue,
            pool,
        };
        let warnings = health::evaluate(&snapshot, &self.config);

        for kind in &warnings {
            warn!(
                warning = ?kind,
                failure_ratio = snapshot.failure_ratio,
                stuck = snapshot.queue.stuck_processing,
                waiting = snapshot.pool.total_waiting,
                "Health check warning"
            );
            self.events.emit(CrawlEvent::HealthWarning {
                kind: *kind,
                stats: snapshot.clone(),
            });
        }

        {
            let mut stats = self.stats.lock().await;
            stats.health_checks += 1;
            stats.last_health_at = Some(snapshot.checked_at);
        }
        metrics::gauge!("rentwatch_queue_pending").set(snapshot.queue.pending as f64);
        metrics::gauge!("rentwatch_queue_failure_ratio").set(snapshot.failure_ratio);

        Ok(HealthReport { snapshot, warnings })
    }
}
