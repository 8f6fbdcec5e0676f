//! Turns freshly stored listings into ranked matches for every active profile.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::MatchingConfig;
use crate::models::{MatchRecord, NormalizedListing, UserPreferenceProfile};
use crate::store::{MatchStore, PreferenceStore};
use crate::Result;

pub mod scoring;

pub use scoring::{score, score_with, MatchScore, SubScores};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchStats {
    pub listings_evaluated: usize,
    pub profiles_evaluated: usize,
    pub matches_kept: usize,
    pub below_threshold: usize,
    pub persisted: usize,
}

pub struct MatchEngine {
    preferences: Arc<dyn PreferenceStore>,
    matches: Arc<dyn MatchStore>,
    config: MatchingConfig,
}

impl MatchEngine {
    pub fn new(preferences: Arc<dyn PreferenceStore>, matches: Arc<dyn MatchStore>, config: MatchingConfig) -> Self {
        Self {
            preferences,
            matches,
            config,
        }
    }

    /// Score `listing` for `prefs` with the configured weights.
    pub fn score(&self, listing: &NormalizedListing, prefs: &UserPreferenceProfile) -> MatchScore {
        score_with(listing, prefs, &self.config.weights)
    }

    fn min_score(&self, prefs: &UserPreferenceProfile) -> u8 {
        prefs.min_match_score.unwrap_or(self.config.default_min_score)
    }

    /// Score every active listing against every active profile and persist the
    /// pairs that reach the profile's minimum score.
    ///
    /// A `(user, listing)` pair seen more than once in the batch is stored once,
    /// with its highest score.
    pub async fn create_matches(&self, listings: &[NormalizedListing]) -> Result<MatchStats> {
        let mut stats = MatchStats::default();
        let listings: Vec<&NormalizedListing> = listings.iter().filter(|l| l.is_active).collect();
        if listings.is_empty() {
            return Ok(stats);
        }

        let profiles = self.preferences.active_profiles().await?;
        stats.listings_evaluated = listings.len();
        stats.profiles_evaluated = profiles.len();

        let now = Utc::now();
        let mut best: HashMap<(String, String), MatchRecord> = HashMap::new();

        for profile in &profiles {
            let threshold = self.min_score(profile);
            for listing in &listings {
                let result = self.score(listing, profile);
                if result.score < threshold {
                    stats.below_threshold += 1;
                    continue;
                }
                stats.matches_kept += 1;

                let key = (profile.user_id.clone(), listing.id.clone());
                let record = MatchRecord {
                    user_id: profile.user_id.clone(),
                    listing_id: listing.id.clone(),
                    score: result.score,
                    matched_criteria: result.matched,
                    missed_criteria: result.missed,
                    created_at: now,
                };
                match best.get(&key) {
                    Some(existing) if existing.score >= record.score => {}
                    _ => {
                        best.insert(key, record);
                    }
                }
            }
        }

        let mut records: Vec<MatchRecord> = best.into_values().collect();
        records.sort_by(|a, b| a.user_id.cmp(&b.user_id).then(b.score.cmp(&a.score)));
        stats.persisted = self.matches.upsert_matches(&records).await?;

        metrics::counter!("rentwatch_matches_created_total").increment(stats.persisted as u64);
        if stats.persisted > 0 {
            info!(
                listings = stats.listings_evaluated,
                profiles = stats.profiles_evaluated,
                persisted = stats.persisted,
                "Created matches"
            );
        } else {
            debug!(
                listings = stats.listings_evaluated,
                profiles = stats.profiles_evaluated,
                "No listings reached a profile's minimum score"
            );
        }
        Ok(stats)
    }
}
