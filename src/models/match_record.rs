use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A ranked pairing of a user and a listing, unique by `(user_id, listing_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchRecord {
    pub user_id: String,
    pub listing_id: String,
    pub score: u8,
    pub matched_criteria: Vec<String>,
    pub missed_criteria: Vec<String>,
    pub created_at: DateTime<Utc>,
}
