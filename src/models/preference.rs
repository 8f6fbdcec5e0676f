use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::{GeoPoint, PropertyType};

/// A user's search profile. Owned by the profile store; the crawler only reads it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserPreferenceProfile {
    pub user_id: String,
    pub min_rent: Option<f64>,
    pub max_rent: Option<f64>,
    pub min_size: Option<f64>,
    pub max_size: Option<f64>,
    pub min_rooms: Option<f64>,
    pub max_rooms: Option<f64>,
    #[serde(default)]
    pub preferred_locations: Vec<String>,
    /// Used for distance scoring when no named areas are preferred.
    pub reference_point: Option<GeoPoint>,
    pub max_distance_km: Option<f64>,
    #[serde(default)]
    pub required_amenities: Vec<String>,
    #[serde(default)]
    pub property_types: Vec<PropertyType>,
    pub move_in_date: Option<NaiveDate>,
    #[serde(default)]
    pub flexible_dates: bool,
    pub min_match_score: Option<u8>,
}

impl UserPreferenceProfile {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            min_rent: None,
            max_rent: None,
            min_size: None,
            max_size: None,
            min_rooms: None,
            max_rooms: None,
            preferred_locations: Vec::new(),
            reference_point: None,
            max_distance_km: None,
            required_amenities: Vec::new(),
            property_types: Vec::new(),
            move_in_date: None,
            flexible_dates: false,
            min_match_score: None,
        }
    }

    pub fn has_location_preference(&self) -> bool {
        !self.preferred_locations.is_empty() || self.reference_point.is_some()
    }
}
