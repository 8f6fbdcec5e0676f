//! In-process fakes for the browser and adapter seams, used by unit tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::adapters::{RawDetail, RawTarget, SourceAdapter};
use crate::browser::{BrowserSession, PageUnit, SessionFactory};
use crate::config::SourceCredentials;
use crate::models::NormalizedListing;
use crate::utils::error::AppError;
use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FakePage {
    Search { targets: Vec<RawTarget> },
    Detail { fields: serde_json::Map<String, serde_json::Value> },
    Blocked,
    /// Navigation to this page never finishes.
    Hang,
}

/// Canned pages served to every fake unit.
#[derive(Clone, Default)]
pub struct FakeSite {
    pages: Arc<Mutex<HashMap<String, FakePage>>>,
    visits: Arc<Mutex<Vec<(String, Instant)>>>,
    latency: Arc<Mutex<Duration>>,
    loading: Arc<Mutex<HashMap<String, usize>>>,
    max_hosts_loading: Arc<AtomicUsize>,
}

impl FakeSite {
    pub fn add_search(&self, url: &str, targets: Vec<RawTarget>) {
        self.insert(url, FakePage::Search { targets });
    }

    pub fn add_detail(&self, url: &str, external_id: &str, total_rent: f64) {
        let detail = FakeAdapter::detail(url, external_id, total_rent);
        self.insert(url, FakePage::Detail { fields: detail.fields });
    }

    pub fn block(&self, url: &str) {
        self.insert(url, FakePage::Blocked);
    }

    pub fn hang(&self, url: &str) {
        self.insert(url, FakePage::Hang);
    }

    /// Make every navigation take `latency` before the page is available.
    pub fn set_latency(&self, latency: Duration) {
        if let Ok(mut current) = self.latency.lock() {
            *current = latency;
        }
    }

    pub fn visits(&self) -> Vec<String> {
        self.visits
            .lock()
            .map(|v| v.iter().map(|(url, _)| url.clone()).collect())
            .unwrap_or_default()
    }

    /// When each navigation started, in visit order.
    pub fn visit_times(&self) -> Vec<Instant> {
        self.visits
            .lock()
            .map(|v| v.iter().map(|(_, at)| *at).collect())
            .unwrap_or_default()
    }

    /// Highest number of distinct hosts that had a navigation in progress at
    /// the same moment.
    pub fn max_hosts_loading(&self) -> usize {
        self.max_hosts_loading.load(Ordering::SeqCst)
    }

    fn start_loading(&self, host: &str) {
        if let Ok(mut loading) = self.loading.lock() {
            *loading.entry(host.to_string()).or_default() += 1;
            let hosts = loading.values().filter(|n| **n > 0).count();
            self.max_hosts_loading.fetch_max(hosts, Ordering::SeqCst);
        }
    }

    fn finish_loading(&self, host: &str) {
        if let Ok(mut loading) = self.loading.lock() {
            if let Some(n) = loading.get_mut(host) {
                *n = n.saturating_sub(1);
            }
        }
    }

    fn latency(&self) -> Duration {
        self.latency.lock().map(|l| *l).unwrap_or_default()
    }

    fn insert(&self, url: &str, page: FakePage) {
        if let Ok(mut pages) = self.pages.lock() {
            pages.insert(url.to_string(), page);
        }
    }

    fn page(&self, url: &str) -> Option<FakePage> {
        self.pages.lock().ok().and_then(|pages| pages.get(url).cloned())
    }
}

#[derive(Default)]
pub struct FakeSessionFactory {
    pub site: FakeSite,
    pub created: AtomicUsize,
    pub fail_create: AtomicBool,
    pub closed_sessions: Arc<AtomicUsize>,
    pub fail_unit_close: Arc<AtomicBool>,
}

impl FakeSessionFactory {
    pub fn with_site(site: FakeSite) -> Self {
        Self {
            site,
            ..Default::default()
        }
    }
}

#[async_trait]
impl SessionFactory for FakeSessionFactory {
    async fn create(&self, source: &str) -> Result<Arc<dyn BrowserSession>> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(AppError::Internal(format!("browser for {} failed to launch", source)));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeSession {
            site: self.site.clone(),
            closed: Arc::clone(&self.closed_sessions),
            fail_unit_close: Arc::clone(&self.fail_unit_close),
        }))
    }
}

pub struct FakeSession {
    site: FakeSite,
    closed: Arc<AtomicUsize>,
    fail_unit_close: Arc<AtomicBool>,
}

#[async_trait]
impl BrowserSession for FakeSession {
    async fn open_unit(&self) -> Result<Box<dyn PageUnit>> {
        Ok(Box::new(FakeUnit {
            site: self.site.clone(),
            current: Mutex::new(None),
            fail_close: Arc::clone(&self.fail_unit_close),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeUnit {
    site: FakeSite,
    current: Mutex<Option<(String, FakePage)>>,
    fail_close: Arc<AtomicBool>,
}

impl FakeUnit {
    fn current(&self) -> Result<(String, FakePage)> {
        self.current
            .lock()
            .ok()
            .and_then(|c| c.clone())
            .ok_or_else(|| AppError::TransientFetch("no page loaded".into()))
    }
}

#[async_trait]
impl PageUnit for FakeUnit {
    async fn navigate(&self, url: &str, _timeout: Duration) -> Result<()> {
        if let Ok(mut visits) = self.site.visits.lock() {
            visits.push((url.to_string(), Instant::now()));
        }

        let latency = self.site.latency();
        if !latency.is_zero() {
            let host = url::Url::parse(url)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
                .unwrap_or_default();
            self.site.start_loading(&host);
            tokio::time::sleep(latency).await;
            self.site.finish_loading(&host);
        }

        let page = self
            .site
            .page(url)
            .ok_or_else(|| AppError::TransientFetch(format!("404 for {}", url)))?;
        if matches!(page, FakePage::Hang) {
            std::future::pending::<()>().await;
        }
        if let Ok(mut current) = self.current.lock() {
            *current = Some((url.to_string(), page));
        }
        Ok(())
    }

    async fn content(&self) -> Result<String> {
        let (_, page) = self.current()?;
        Ok(serde_json::to_string(&page)?)
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.current()?.0)
    }

    async fn evaluate(&self, _script: &str) -> Result<serde_json::Value> {
        let (_, page) = self.current()?;
        Ok(serde_json::to_value(page)?)
    }

    async fn close(&self) -> Result<()> {
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(AppError::Internal("tab already detached".into()));
        }
        Ok(())
    }
}

/// Adapter that reads [`FakePage`]s back out of a [`FakeUnit`].
pub struct FakeAdapter {
    source_id: String,
    pub needs_auth: bool,
    pub auth_succeeds: AtomicBool,
    pub auth_calls: AtomicUsize,
}

impl FakeAdapter {
    pub fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            needs_auth: false,
            auth_succeeds: AtomicBool::new(true),
            auth_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_auth(mut self) -> Self {
        self.needs_auth = true;
        self
    }

    pub fn search_url(source_id: &str, page: u32) -> String {
        format!("https://{}.example/search?page={}", source_id, page)
    }

    pub fn detail(url: &str, external_id: &str, total_rent: f64) -> RawDetail {
        let mut fields = serde_json::Map::new();
        fields.insert("external_id".into(), serde_json::json!(external_id));
        fields.insert("title".into(), serde_json::json!(format!("Flat {}", external_id)));
        fields.insert("total_rent".into(), serde_json::json!(total_rent));
        fields.insert("city".into(), serde_json::json!("Berlin"));
        RawDetail {
            url: url.to_string(),
            fields,
        }
    }

    async fn page(&self, unit: &dyn PageUnit) -> Result<FakePage> {
        Ok(serde_json::from_value(unit.evaluate("page").await?)?)
    }
}

#[async_trait]
impl SourceAdapter for FakeAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn requires_auth(&self) -> bool {
        self.needs_auth
    }

    fn build_search_target(&self, _filters: &HashMap<String, String>, page: u32) -> Result<String> {
        Ok(Self::search_url(&self.source_id, page))
    }

    async fn extract_targets_from_listing_page(&self, unit: &dyn PageUnit) -> Result<Vec<RawTarget>> {
        match self.page(unit).await? {
            FakePage::Search { targets } => Ok(targets),
            _ => Err(AppError::Adapter {
                source_id: self.source_id.clone(),
                message: "not a search page".into(),
            }),
        }
    }

    async fn extract_detail(&self, unit: &dyn PageUnit, url: &str) -> Result<RawDetail> {
        match self.page(unit).await? {
            FakePage::Detail { fields } => Ok(RawDetail {
                url: url.to_string(),
                fields,
            }),
            _ => Err(AppError::Adapter {
                source_id: self.source_id.clone(),
                message: "not a detail page".into(),
            }),
        }
    }

    async fn authenticate(&self, _unit: &dyn PageUnit, _credentials: Option<&SourceCredentials>) -> Result<bool> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.auth_succeeds.load(Ordering::SeqCst))
    }

    async fn detect_blocked(&self, unit: &dyn PageUnit) -> Result<bool> {
        Ok(matches!(self.page(unit).await?, FakePage::Blocked))
    }

    fn to_normalized_listing(&self, detail: RawDetail) -> Result<NormalizedListing> {
        let text = |key: &str| detail.fields.get(key).and_then(|v| v.as_str()).map(str::to_string);

        let source = text("source").unwrap_or_else(|| self.source_id.clone());
        let external_id = text("external_id").unwrap_or_default();
        let title = text("title").unwrap_or_default();

        let mut listing = NormalizedListing::new(&source, &external_id, &detail.url, &title);
        listing.costs.total_rent = detail.fields.get("total_rent").and_then(|v| v.as_f64());
        listing.location.city = text("city");
        if let Some(active) = detail.fields.get("active").and_then(|v| v.as_bool()) {
            listing.is_active = active;
        }
        Ok(listing)
    }
}
