//! Deterministic multi-factor scoring of a listing against a preference profile.

use serde::{Deserialize, Serialize};

use crate::config::ScoreWeights;
use crate::models::{NormalizedListing, UserPreferenceProfile};

/// Sub-scores at or above this count as a matched criterion.
const MATCHED_THRESHOLD: f64 = 70.0;

/// Score given when the listing does not state the value being compared.
const UNKNOWN_SCORE: f64 = 50.0;

const OVER_BUDGET_PENALTY_FACTOR: f64 = 200.0;
const BELOW_MIN_RENT_SCORE: f64 = 85.0;
/// Drop across a `[min_rent, max_rent]` range, from 100 at the minimum.
const IN_RANGE_PRICE_SPREAD: f64 = 10.0;
const AREA_MISMATCH_SCORE: f64 = 50.0;
const DEFAULT_MAX_DISTANCE_KM: f64 = 5.0;
const DISTANCE_PENALTY_PER_KM: f64 = 10.0;
const MISSING_AMENITY_PENALTY: f64 = 5.0;
const PROPERTY_TYPE_MISMATCH_SCORE: f64 = 40.0;
const PROPERTY_TYPE_UNKNOWN_SCORE: f64 = 70.0;

const UNDER_BUDGET_RATIO: f64 = 0.9;
const UNDER_BUDGET_BONUS: f64 = 5.0;
const AMENITY_ABUNDANCE_COUNT: usize = 10;
const AMENITY_ABUNDANCE_BONUS: f64 = 3.0;
const MOVE_IN_SOON_DAYS: i64 = 14;
const IMMEDIATE_AVAILABILITY_BONUS: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubScores {
    pub price: f64,
    pub location: f64,
    pub size: f64,
    pub amenities: f64,
    pub availability: f64,
    pub property_type: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchScore {
    pub score: u8,
    pub matched: Vec<String>,
    pub missed: Vec<String>,
    pub breakdown: SubScores,
}

/// Score with the default weights.
pub fn score(listing: &NormalizedListing, prefs: &UserPreferenceProfile) -> MatchScore {
    score_with(listing, prefs, &ScoreWeights::default())
}

/// Composite score: `100 - Σ (100 - sub_i) * weight_i`, plus flat bonuses,
/// clamped to `[0, 100]` and rounded.
pub fn score_with(listing: &NormalizedListing, prefs: &UserPreferenceProfile, weights: &ScoreWeights) -> MatchScore {
    let breakdown = SubScores {
        price: price_score(listing, prefs),
        location: location_score(listing, prefs),
        size: size_score(listing, prefs),
        amenities: amenity_score(listing, prefs),
        availability: availability_score(listing, prefs),
        property_type: property_type_score(listing, prefs),
    };

    let penalty = (100.0 - breakdown.price) * weights.price
        + (100.0 - breakdown.location) * weights.location
        + (100.0 - breakdown.size) * weights.size
        + (100.0 - breakdown.amenities) * weights.amenities
        + (100.0 - breakdown.availability) * weights.availability
        + (100.0 - breakdown.property_type) * weights.property_type;

    let mut matched = Vec::new();
    let mut missed = Vec::new();
    let criteria = [
        ("price", prefs.min_rent.is_some() || prefs.max_rent.is_some(), breakdown.price),
        ("location", prefs.has_location_preference(), breakdown.location),
        ("size", has_size_preference(prefs), breakdown.size),
        ("amenities", !prefs.required_amenities.is_empty(), breakdown.amenities),
        ("availability", prefs.move_in_date.is_some(), breakdown.availability),
        ("property_type", !prefs.property_types.is_empty(), breakdown.property_type),
    ];
    for (name, expressed, sub) in criteria {
        if !expressed {
            continue;
        }
        if sub >= MATCHED_THRESHOLD {
            matched.push(name.to_string());
        } else {
            missed.push(name.to_string());
        }
    }

    let mut bonus = 0.0;
    if let (Some(rent), Some(max)) = (listing.costs.effective_total(), prefs.max_rent) {
        if rent <= max * UNDER_BUDGET_RATIO {
            bonus += UNDER_BUDGET_BONUS;
            matched.push("under_budget".to_string());
        }
    }
    if listing.amenities.len() >= AMENITY_ABUNDANCE_COUNT {
        bonus += AMENITY_ABUNDANCE_BONUS;
        matched.push("many_amenities".to_string());
    }
    if available_now_and_needed_soon(listing, prefs) {
        bonus += IMMEDIATE_AVAILABILITY_BONUS;
        matched.push("available_now".to_string());
    }

    let total = (100.0 - penalty + bonus).clamp(0.0, 100.0).round() as u8;

    MatchScore {
        score: total,
        matched,
        missed,
        breakdown,
    }
}

fn price_score(listing: &NormalizedListing, prefs: &UserPreferenceProfile) -> f64 {
    if prefs.min_rent.is_none() && prefs.max_rent.is_none() {
        return 100.0;
    }
    let Some(rent) = listing.costs.effective_total() else {
        return UNKNOWN_SCORE;
    };

    if let Some(max) = prefs.max_rent.filter(|max| *max > 0.0) {
        if rent > max {
            let over = (rent - max) / max;
            return (100.0 - over * OVER_BUDGET_PENALTY_FACTOR).max(0.0);
        }
    }
    if let Some(min) = prefs.min_rent {
        if rent < min {
            return BELOW_MIN_RENT_SCORE;
        }
        if let Some(max) = prefs.max_rent.filter(|max| *max > min) {
            return 100.0 - IN_RANGE_PRICE_SPREAD * (rent - min) / (max - min);
        }
    }
    100.0
}

fn location_score(listing: &NormalizedListing, prefs: &UserPreferenceProfile) -> f64 {
    if !prefs.preferred_locations.is_empty() {
        let fields = [
            &listing.location.district,
            &listing.location.city,
            &listing.location.postal_code,
            &listing.location.address,
        ];
        let haystack: Vec<String> = fields.iter().filter_map(|f| f.as_deref()).map(str::to_lowercase).collect();

        let in_preferred_area = prefs.preferred_locations.iter().any(|wanted| {
            let wanted = wanted.trim().to_lowercase();
            !wanted.is_empty() && haystack.iter().any(|field| field.contains(&wanted))
        });
        return if in_preferred_area { 100.0 } else { AREA_MISMATCH_SCORE };
    }

    let Some(reference) = prefs.reference_point else {
        return 100.0;
    };
    let Some(coordinates) = listing.location.coordinates() else {
        return UNKNOWN_SCORE;
    };

    let max_km = prefs.max_distance_km.unwrap_or(DEFAULT_MAX_DISTANCE_KM);
    let distance = reference.distance_km(&coordinates);
    if distance <= max_km {
        100.0
    } else {
        (100.0 - (distance - max_km) * DISTANCE_PENALTY_PER_KM).max(0.0)
    }
}

fn has_size_preference(prefs: &UserPreferenceProfile) -> bool {
    prefs.min_size.is_some() || prefs.max_size.is_some() || prefs.min_rooms.is_some() || prefs.max_rooms.is_some()
}

fn size_score(listing: &NormalizedListing, prefs: &UserPreferenceProfile) -> f64 {
    let mut parts = Vec::new();

    if prefs.min_size.is_some() || prefs.max_size.is_some() {
        parts.push(match listing.size_sqm {
            None => UNKNOWN_SCORE,
            Some(size) => range_score(size, prefs.min_size, prefs.max_size, 200.0, 100.0, 60.0),
        });
    }
    if prefs.min_rooms.is_some() || prefs.max_rooms.is_some() {
        parts.push(match listing.rooms {
            None => UNKNOWN_SCORE,
            Some(rooms) => range_score(rooms, prefs.min_rooms, prefs.max_rooms, 100.0, 50.0, 50.0),
        });
    }

    if parts.is_empty() {
        100.0
    } else {
        parts.iter().sum::<f64>() / parts.len() as f64
    }
}

/// Proportional penalty outside `[min, max]`. Falling short is penalized
/// harder than exceeding, and exceeding never drops below `over_floor`.
fn range_score(value: f64, min: Option<f64>, max: Option<f64>, under_factor: f64, over_factor: f64, over_floor: f64) -> f64 {
    if let Some(min) = min.filter(|m| *m > 0.0) {
        if value < min {
            return (100.0 - (min - value) / min * under_factor).max(0.0);
        }
    }
    if let Some(max) = max.filter(|m| *m > 0.0) {
        if value > max {
            return (100.0 - (value - max) / max * over_factor).max(over_floor);
        }
    }
    100.0
}

fn amenity_score(listing: &NormalizedListing, prefs: &UserPreferenceProfile) -> f64 {
    let required = &prefs.required_amenities;
    if required.is_empty() {
        return 100.0;
    }
    let present = required.iter().filter(|a| listing.has_amenity(a)).count();
    let missing = required.len() - present;

    (present as f64 / required.len() as f64 * 100.0 - missing as f64 * MISSING_AMENITY_PENALTY).max(0.0)
}

fn availability_score(listing: &NormalizedListing, prefs: &UserPreferenceProfile) -> f64 {
    let Some(move_in) = prefs.move_in_date else {
        return 100.0;
    };
    let Some(available_from) = listing.availability.available_from else {
        return UNKNOWN_SCORE;
    };
    if listing.availability.available_to.is_some_and(|to| to < move_in) {
        return 0.0;
    }

    let days_late = (available_from - move_in).num_days();
    if days_late <= 0 {
        return 100.0;
    }

    let tiers: [(i64, f64); 4] = if prefs.flexible_dates {
        [(14, 90.0), (30, 75.0), (60, 50.0), (i64::MAX, 25.0)]
    } else {
        [(7, 80.0), (14, 60.0), (30, 30.0), (i64::MAX, 0.0)]
    };
    tiers
        .iter()
        .find(|(limit, _)| days_late <= *limit)
        .map(|(_, score)| *score)
        .unwrap_or(0.0)
}

fn property_type_score(listing: &NormalizedListing, prefs: &UserPreferenceProfile) -> f64 {
    if prefs.property_types.is_empty() {
        return 100.0;
    }
    match listing.property_type {
        None => PROPERTY_TYPE_UNKNOWN_SCORE,
        Some(kind) if prefs.property_types.contains(&kind) => 100.0,
        Some(_) => PROPERTY_TYPE_MISMATCH_SCORE,
    }
}

/// The listing is free already (as of its scrape date) and the user wants to
/// move within two weeks of that date.
fn available_now_and_needed_soon(listing: &NormalizedListing, prefs: &UserPreferenceProfile) -> bool {
    let reference = listing.scraped_at.date_naive();
    let (Some(move_in), Some(available_from)) = (prefs.move_in_date, listing.availability.available_from) else {
        return false;
    };
    available_from <= reference && (move_in - reference).num_days() <= MOVE_IN_SOON_DAYS
}
