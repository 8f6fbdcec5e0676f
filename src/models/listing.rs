use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::{generate_id, DataCategory, PropertyType};

const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Great-circle distance (haversine).
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        let (lat1, lat2) = (self.latitude.to_radians(), other.latitude.to_radians());
        let dlat = (other.latitude - self.latitude).to_radians();
        let dlon = (other.longitude - self.longitude).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Location {
    pub address: Option<String>,
    pub district: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl Location {
    pub fn coordinates(&self) -> Option<GeoPoint> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some(GeoPoint::new(lat, lon)),
            _ => None,
        }
    }

    fn is_empty(&self) -> bool {
        self.address.is_none()
            && self.district.is_none()
            && self.city.is_none()
            && self.postal_code.is_none()
            && self.coordinates().is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Availability {
    pub available_from: Option<NaiveDate>,
    pub available_to: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Validate)]
pub struct CostBreakdown {
    #[validate(range(min = 0.0))]
    pub base_rent: Option<f64>,
    #[validate(range(min = 0.0))]
    pub utilities: Option<f64>,
    #[validate(range(min = 0.0))]
    pub total_rent: Option<f64>,
    #[validate(range(min = 0.0))]
    pub deposit: Option<f64>,
    pub currency: Option<String>,
}

impl CostBreakdown {
    /// Total monthly rent, derived from base + utilities when not stated.
    pub fn effective_total(&self) -> Option<f64> {
        self.total_rent
            .or_else(|| self.base_rent.map(|base| base + self.utilities.unwrap_or(0.0)))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContactInfo {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
}

impl ContactInfo {
    fn is_empty(&self) -> bool {
        self.name.is_none() && self.phone.is_none() && self.email.is_none()
    }
}

/// The canonical cross-source listing record, unique by `(source, external_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct NormalizedListing {
    pub id: String,
    #[validate(length(min = 1))]
    pub source: String,
    #[validate(length(min = 1))]
    pub external_id: String,
    #[validate(url)]
    pub url: String,
    pub title: String,
    pub description: Option<String>,
    #[validate(range(min = 0.0))]
    pub size_sqm: Option<f64>,
    #[validate(range(min = 0.0))]
    pub rooms: Option<f64>,
    pub floor: Option<i32>,
    pub property_type: Option<PropertyType>,
    pub location: Location,
    pub availability: Availability,
    #[validate(nested)]
    pub costs: CostBreakdown,
    pub contact: ContactInfo,
    pub images: Vec<String>,
    pub amenities: Vec<String>,
    /// Source specific fields the normalized model has no slot for.
    pub source_data: serde_json::Map<String, serde_json::Value>,
    /// False once the source reports the listing as gone.
    pub is_active: bool,
    pub first_scraped_at: DateTime<Utc>,
    pub scraped_at: DateTime<Utc>,
}

impl NormalizedListing {
    pub fn new(source: &str, external_id: &str, url: &str, title: &str) -> Self {
        let now = Utc::now();
        Self {
            id: generate_id(),
            source: source.to_string(),
            external_id: external_id.to_string(),
            url: url.to_string(),
            title: title.to_string(),
            description: None,
            size_sqm: None,
            rooms: None,
            floor: None,
            property_type: None,
            location: Location::default(),
            availability: Availability::default(),
            costs: CostBreakdown::default(),
            contact: ContactInfo::default(),
            images: Vec::new(),
            amenities: Vec::new(),
            source_data: serde_json::Map::new(),
            is_active: true,
            first_scraped_at: now,
            scraped_at: now,
        }
    }

    /// Field groups that are still empty and worth another scrape.
    pub fn missing_categories(&self) -> Vec<DataCategory> {
        let mut missing = Vec::new();
        if self.costs.effective_total().is_none() {
            missing.push(DataCategory::Pricing);
        }
        if self.location.is_empty() {
            missing.push(DataCategory::Location);
        }
        if self.availability.available_from.is_none() {
            missing.push(DataCategory::Availability);
        }
        if self.size_sqm.is_none() && self.rooms.is_none() {
            missing.push(DataCategory::Size);
        }
        if self.contact.is_empty() {
            missing.push(DataCategory::Contact);
        }
        if self.images.is_empty() {
            missing.push(DataCategory::Media);
        }
        missing
    }

    pub fn is_complete(&self) -> bool {
        self.missing_categories().is_empty()
    }

    pub fn has_amenity(&self, amenity: &str) -> bool {
        let wanted = amenity.trim().to_lowercase();
        self.amenities.iter().any(|a| a.trim().to_lowercase() == wanted)
    }
}
