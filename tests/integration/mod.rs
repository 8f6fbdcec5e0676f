// Integration tests for rentwatch
// These tests drive the public API against a file-backed database

pub mod pipeline_tests;
pub mod queue_concurrency_tests;
pub mod store_concurrency_tests;

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use rentwatch::config::{DatabaseConfig, SourceConfig, SourceCredentials};
use rentwatch::models::NormalizedListing;
use rentwatch::{
    db, AdapterRegistry, AppConfig, AppError, BrowserSession, Coordinator, CoordinatorDeps, EventBus, MatchEngine,
    PageUnit, RawDetail, RawTarget, ResourcePool, SessionFactory, SourceAdapter, SqliteStore, WorkQueue,
};

/// Test configuration: no retry delay, short timeouts, small pool.
pub fn get_test_config(sources: &[&str]) -> AppConfig {
    let mut config = AppConfig::default();
    config.queue.retry_delay_secs = 0;
    config.queue.batch_size = 20;
    config.pool.max_sessions_per_source = 1;
    config.pool.max_total_sessions = 3;
    config.pool.acquire_timeout_secs = 5;
    config.coordinator.item_timeout_secs = 5;
    config.sources = sources.iter().map(|id| SourceConfig::new(id)).collect();
    config
}

/// Create a migrated database in a fresh temporary directory
pub async fn create_test_db() -> anyhow::Result<(TempDir, SqlitePool)> {
    let dir = tempfile::tempdir()?;
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("rentwatch.db").display());
    let pool = db::connect(&DatabaseConfig { url, max_connections: 8 }).await?;
    db::migrate(&pool).await?;
    Ok((dir, pool))
}

pub fn search_url(source: &str) -> String {
    format!("https://{}.test/search", source)
}

pub fn detail_url(source: &str, id: u32) -> String {
    format!("https://{}.test/flat/{}", source, id)
}

/// Pages served to every unit, keyed by URL.
#[derive(Clone, Default)]
pub struct StaticSite {
    pages: Arc<Mutex<HashMap<String, Value>>>,
    visits: Arc<AtomicUsize>,
}

impl StaticSite {
    pub fn serve(&self, url: &str, page: Value) {
        self.pages.lock().unwrap().insert(url.to_string(), page);
    }

    /// A search page linking to `ids`, plus one detail page per id.
    pub fn publish(&self, source: &str, ids: &[u32], rent: f64) {
        let links: Vec<String> = ids.iter().map(|id| detail_url(source, *id)).collect();
        self.serve(&search_url(source), json!({ "kind": "search", "links": links }));
        for id in ids {
            self.serve(
                &detail_url(source, *id),
                json!({
                    "kind": "flat",
                    "id": id.to_string(),
                    "title": format!("{} flat {}", source, id),
                    "rent": rent,
                    "city": "Berlin",
                    "rooms": 2.0,
                }),
            );
        }
    }

    pub fn visits(&self) -> usize {
        self.visits.load(Ordering::SeqCst)
    }

    fn page(&self, url: &str) -> Option<Value> {
        self.pages.lock().unwrap().get(url).cloned()
    }
}

pub struct StaticFactory {
    pub site: StaticSite,
    pub sessions: AtomicUsize,
}

impl StaticFactory {
    pub fn new(site: StaticSite) -> Self {
        Self {
            site,
            sessions: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SessionFactory for StaticFactory {
    async fn create(&self, _source: &str) -> rentwatch::Result<Arc<dyn BrowserSession>> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(StaticSession { site: self.site.clone() }))
    }
}

struct StaticSession {
    site: StaticSite,
}

#[async_trait]
impl BrowserSession for StaticSession {
    async fn open_unit(&self) -> rentwatch::Result<Box<dyn PageUnit>> {
        Ok(Box::new(StaticTab {
            site: self.site.clone(),
            loaded: Mutex::new(None),
        }))
    }

    async fn close(&self) -> rentwatch::Result<()> {
        Ok(())
    }
}

struct StaticTab {
    site: StaticSite,
    loaded: Mutex<Option<(String, Value)>>,
}

impl StaticTab {
    fn loaded(&self) -> rentwatch::Result<(String, Value)> {
        self.loaded
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| AppError::TransientFetch("nothing loaded".into()))
    }
}

#[async_trait]
impl PageUnit for StaticTab {
    async fn navigate(&self, url: &str, _timeout: Duration) -> rentwatch::Result<()> {
        self.site.visits.fetch_add(1, Ordering::SeqCst);
        let page = self
            .site
            .page(url)
            .ok_or_else(|| AppError::TransientFetch(format!("connection refused: {}", url)))?;
        *self.loaded.lock().unwrap() = Some((url.to_string(), page));
        Ok(())
    }

    async fn content(&self) -> rentwatch::Result<String> {
        Ok(self.loaded()?.1.to_string())
    }

    async fn current_url(&self) -> rentwatch::Result<String> {
        Ok(self.loaded()?.0)
    }

    async fn evaluate(&self, _script: &str) -> rentwatch::Result<Value> {
        Ok(self.loaded()?.1)
    }

    async fn close(&self) -> rentwatch::Result<()> {
        Ok(())
    }
}

/// Adapter for the JSON pages served by [`StaticSite`].
pub struct JsonAdapter {
    source: String,
}

impl JsonAdapter {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
        }
    }
}

#[async_trait]
impl SourceAdapter for JsonAdapter {
    fn source_id(&self) -> &str {
        &self.source
    }

    fn build_search_target(&self, _filters: &HashMap<String, String>, _page: u32) -> rentwatch::Result<String> {
        Ok(search_url(&self.source))
    }

    async fn extract_targets_from_listing_page(&self, unit: &dyn PageUnit) -> rentwatch::Result<Vec<RawTarget>> {
        let page = unit.evaluate("document").await?;
        let links = page["links"].as_array().cloned().unwrap_or_default();
        Ok(links
            .iter()
            .filter_map(|link| link.as_str())
            .map(RawTarget::new)
            .collect())
    }

    async fn extract_detail(&self, unit: &dyn PageUnit, url: &str) -> rentwatch::Result<RawDetail> {
        let page = unit.evaluate("document").await?;
        let fields = page.as_object().cloned().unwrap_or_default();
        Ok(RawDetail {
            url: url.to_string(),
            fields,
        })
    }

    async fn authenticate(&self, _unit: &dyn PageUnit, _credentials: Option<&SourceCredentials>) -> rentwatch::Result<bool> {
        Ok(true)
    }

    async fn detect_blocked(&self, unit: &dyn PageUnit) -> rentwatch::Result<bool> {
        Ok(unit.evaluate("document").await?["kind"] == "captcha")
    }

    fn to_normalized_listing(&self, detail: RawDetail) -> rentwatch::Result<NormalizedListing> {
        let text = |key: &str| detail.fields.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
        let mut listing = NormalizedListing::new(&self.source, &text("id"), &detail.url, &text("title"));
        listing.costs.total_rent = detail.fields.get("rent").and_then(Value::as_f64);
        listing.rooms = detail.fields.get("rooms").and_then(Value::as_f64);
        listing.location.city = detail.fields.get("city").and_then(Value::as_str).map(str::to_string);
        Ok(listing)
    }
}

/// Every component wired together over one temporary database
pub struct TestSystem {
    pub _dir: TempDir,
    pub coordinator: Coordinator,
    pub queue: Arc<WorkQueue>,
    pub store: SqliteStore,
    pub site: StaticSite,
    pub factory: Arc<StaticFactory>,
}

pub async fn create_test_system(config: AppConfig) -> anyhow::Result<TestSystem> {
    let (dir, pool) = create_test_db().await?;
    let store = SqliteStore::new(pool.clone());
    let queue = Arc::new(WorkQueue::new(pool, config.queue.clone(), config.source_weights()));

    let site = StaticSite::default();
    let factory = Arc::new(StaticFactory::new(site.clone()));
    let events = EventBus::new();
    let resource_pool = Arc::new(ResourcePool::new(config.pool.clone(), factory.clone(), events.clone()));

    let adapters = AdapterRegistry::new();
    for source in config.enabled_sources() {
        adapters.register(Arc::new(JsonAdapter::new(&source.id))).await?;
    }

    let shared = Arc::new(store.clone());
    let match_engine = Arc::new(MatchEngine::new(shared.clone(), shared.clone(), config.matching.clone()));
    let coordinator = Coordinator::new(
        &config,
        CoordinatorDeps {
            queue: Arc::clone(&queue),
            pool: resource_pool,
            listings: shared,
            adapters,
            match_engine,
            events,
        },
    )
    .await?;

    Ok(TestSystem {
        _dir: dir,
        coordinator,
        queue,
        store,
        site,
        factory,
    })
}

/// Helper to wait for async operations
pub async fn wait_for_condition<F, Fut>(mut condition: F, timeout_seconds: u64) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_seconds);

    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    false
}
