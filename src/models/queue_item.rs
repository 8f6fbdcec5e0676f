use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{DataCategory, QueueStatus};
use crate::utils::error::AppError;

/// What the coordinator should do with a fetched page.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    /// Search results page, yields more targets.
    Discovery,
    /// Single listing page, yields a normalized listing.
    Detail,
}

/// Typed metadata stored alongside each queue row.
///
/// Adapter-specific values go into `extra`; everything the core reads has a
/// named field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueMetadata {
    pub kind: TargetKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl QueueMetadata {
    pub fn discovery(page: u32) -> Self {
        Self {
            kind: TargetKind::Discovery,
            page: Some(page),
            external_id: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn detail(external_id: Option<String>) -> Self {
        Self {
            kind: TargetKind::Detail,
            page: None,
            external_id,
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueItem {
    pub id: i64,
    pub source: String,
    pub url: String,
    pub listing_id: Option<String>,
    pub priority: i64,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub status: QueueStatus,
    pub data_needed: Vec<DataCategory>,
    pub metadata: QueueMetadata,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    pub fn kind(&self) -> TargetKind {
        self.metadata.kind
    }

    pub fn is_discovery(&self) -> bool {
        self.metadata.kind == TargetKind::Discovery
    }
}

/// A target to be inserted into (or merged with) the work queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewQueueItem {
    pub source: String,
    pub url: String,
    pub listing_id: Option<String>,
    /// Explicit priority; computed from the item's signals when absent.
    pub priority: Option<i64>,
    pub data_needed: Vec<DataCategory>,
    pub metadata: QueueMetadata,
}

impl NewQueueItem {
    pub fn discovery(source: &str, url: &str, page: u32) -> Self {
        Self {
            source: source.to_string(),
            url: url.to_string(),
            listing_id: None,
            priority: None,
            data_needed: Vec::new(),
            metadata: QueueMetadata::discovery(page),
        }
    }

    /// A detail target for a listing that has never been scraped.
    pub fn detail(source: &str, url: &str) -> Self {
        Self {
            source: source.to_string(),
            url: url.to_string(),
            listing_id: None,
            priority: None,
            data_needed: DataCategory::ALL.to_vec(),
            metadata: QueueMetadata::detail(None),
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_listing(mut self, listing_id: &str) -> Self {
        self.listing_id = Some(listing_id.to_string());
        self
    }

    pub fn with_external_id(mut self, external_id: &str) -> Self {
        self.metadata.external_id = Some(external_id.to_string());
        self
    }

    pub fn with_data_needed(mut self, mut categories: Vec<DataCategory>) -> Self {
        categories.sort();
        categories.dedup();
        self.data_needed = categories;
        self
    }

    /// Reject targets the queue cannot key or dispatch.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.source.trim().is_empty() {
            return Err(AppError::Validation("Queue item source must not be empty".into()));
        }
        let parsed = url::Url::parse(&self.url)
            .map_err(|e| AppError::Validation(format!("Invalid queue item url {}: {}", self.url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AppError::Validation(format!(
                "Unsupported url scheme for queue item: {}",
                self.url
            )));
        }
        Ok(())
    }
}
