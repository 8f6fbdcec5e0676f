//! Persistence collaborators used by the queue, the coordinator and the match engine.
//!
//! The core only talks to these traits; [`SqliteStore`] is the bundled
//! implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{MatchRecord, NormalizedListing, UserPreferenceProfile};
use crate::Result;

pub mod sqlite;

pub use sqlite::SqliteStore;

/// Whether an upsert created a new listing or refreshed an existing one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub listing_id: String,
    pub inserted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingCounts {
    pub total: u64,
    pub active: u64,
    pub incomplete: u64,
}

#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Insert or update keyed by `(source, external_id)`.
    ///
    /// The returned id is the stored row's id, which differs from
    /// `listing.id` when the listing already existed.
    async fn upsert_listing(&self, listing: &NormalizedListing) -> Result<UpsertOutcome>;

    async fn get_listing(&self, id: &str) -> Result<Option<NormalizedListing>>;

    /// Active listings last scraped before `older_than`, oldest first.
    async fn find_stale(&self, older_than: DateTime<Utc>, limit: usize) -> Result<Vec<NormalizedListing>>;

    /// Active listings with at least one missing data category, last scraped
    /// before `older_than`.
    async fn find_incomplete(&self, older_than: DateTime<Utc>, limit: usize) -> Result<Vec<NormalizedListing>>;

    async fn listing_counts(&self) -> Result<ListingCounts>;
}

#[async_trait]
pub trait MatchStore: Send + Sync {
    /// Insert or replace keyed by `(user_id, listing_id)`. Returns rows written.
    async fn upsert_matches(&self, records: &[MatchRecord]) -> Result<usize>;

    async fn matches_for_user(&self, user_id: &str) -> Result<Vec<MatchRecord>>;
}

#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn active_profiles(&self) -> Result<Vec<UserPreferenceProfile>>;
}
