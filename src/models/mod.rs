use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod listing;
pub mod match_record;
pub mod preference;
pub mod queue_item;

// Re-exports for convenience
pub use listing::*;
pub use match_record::*;
pub use preference::*;
pub use queue_item::*;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Groups of listing fields a scrape target is expected to fill in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum DataCategory {
    Pricing,
    Location,
    Availability,
    Size,
    Contact,
    Media,
}

impl DataCategory {
    pub const ALL: [DataCategory; 6] = [
        DataCategory::Pricing,
        DataCategory::Location,
        DataCategory::Availability,
        DataCategory::Size,
        DataCategory::Contact,
        DataCategory::Media,
    ];
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    Apartment,
    Studio,
    Room,
    SharedFlat,
    House,
}

// Helper function to generate UUIDs in the format expected by the database
pub fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()
}
