use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use validator::Validate;

use super::traits::{RawDetail, SourceAdapter};
use crate::models::NormalizedListing;
use crate::utils::error::AppError;
use crate::Result;

pub type SourceAdapterRef = Arc<dyn SourceAdapter>;

/// Adapters keyed by source id.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: Arc<RwLock<HashMap<String, SourceAdapterRef>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize and register an adapter, replacing any adapter with the same id.
    pub async fn register(&self, adapter: SourceAdapterRef) -> Result<()> {
        let source_id = adapter.source_id().to_string();
        adapter.initialize().await.map_err(|e| AppError::Adapter {
            source_id: source_id.clone(),
            message: format!("Failed to initialize: {}", e),
        })?;

        let mut adapters = self.adapters.write().await;
        if adapters.insert(source_id.clone(), adapter).is_some() {
            tracing::warn!(source = %source_id, "Replaced existing source adapter");
        }
        Ok(())
    }

    pub async fn get(&self, source_id: &str) -> Option<SourceAdapterRef> {
        self.adapters.read().await.get(source_id).cloned()
    }

    pub async fn has_adapter(&self, source_id: &str) -> bool {
        self.adapters.read().await.contains_key(source_id)
    }

    pub async fn list_sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self.adapters.read().await.keys().cloned().collect();
        sources.sort();
        sources
    }

    pub async fn shutdown(&self) {
        let mut adapters = self.adapters.write().await;
        for (source_id, adapter) in adapters.drain() {
            if let Err(e) = adapter.shutdown().await {
                tracing::warn!(source = %source_id, error = %e, "Error shutting down source adapter");
            }
        }
    }
}

/// Normalize a raw detail and check it before it reaches the store.
pub fn normalize_detail(adapter: &dyn SourceAdapter, detail: RawDetail) -> Result<NormalizedListing> {
    let listing = adapter.to_normalized_listing(detail)?;

    if listing.source != adapter.source_id() {
        return Err(AppError::Adapter {
            source_id: adapter.source_id().to_string(),
            message: format!("Listing {} claims source '{}'", listing.external_id, listing.source),
        });
    }
    listing.validate()?;
    Ok(listing)
}
