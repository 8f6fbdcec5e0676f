use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::browser::PageUnit;
use crate::config::SourceCredentials;
use crate::models::{DataCategory, NewQueueItem, NormalizedListing};
use crate::Result;

/// A link found on a search results page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawTarget {
    pub url: String,
    pub external_id: Option<String>,
    /// Categories the detail page is expected to fill; empty means all of them.
    #[serde(default)]
    pub data_needed: Vec<DataCategory>,
    pub priority: Option<i64>,
    /// Adapter specific values carried through the queue row's metadata.
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RawTarget {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }

    pub fn with_external_id(mut self, external_id: &str) -> Self {
        self.external_id = Some(external_id.to_string());
        self
    }

    pub fn into_queue_item(self, source: &str) -> NewQueueItem {
        let mut item = NewQueueItem::detail(source, &self.url);
        if let Some(external_id) = &self.external_id {
            item = item.with_external_id(external_id);
        }
        if !self.data_needed.is_empty() {
            item = item.with_data_needed(self.data_needed);
        }
        if let Some(priority) = self.priority {
            item = item.with_priority(priority);
        }
        item.metadata.extra = self.extra;
        item
    }
}

/// Raw fields pulled off a listing page, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawDetail {
    pub url: String,
    pub fields: serde_json::Map<String, serde_json::Value>,
}

/// Extraction logic for one listings site.
///
/// Adapters only ever receive a checked-out [`PageUnit`]; the coordinator owns
/// session acquisition, retries and persistence.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Identifier matching the `id` of the source's configuration entry.
    fn source_id(&self) -> &str;

    fn requires_auth(&self) -> bool {
        false
    }

    /// URL of search results page `page` (1-based) for the given filters.
    fn build_search_target(&self, filters: &HashMap<String, String>, page: u32) -> Result<String>;

    /// Read listing links from the search results page currently loaded in `unit`.
    async fn extract_targets_from_listing_page(&self, unit: &dyn PageUnit) -> Result<Vec<RawTarget>>;

    /// Read the listing page currently loaded in `unit`.
    async fn extract_detail(&self, unit: &dyn PageUnit, url: &str) -> Result<RawDetail>;

    /// Log in using `unit`. Returns whether the login succeeded.
    async fn authenticate(&self, unit: &dyn PageUnit, credentials: Option<&SourceCredentials>) -> Result<bool>;

    /// Whether the loaded page is a block or challenge page instead of content.
    async fn detect_blocked(&self, unit: &dyn PageUnit) -> Result<bool>;

    fn to_normalized_listing(&self, detail: RawDetail) -> Result<NormalizedListing>;

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
