use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, SqlitePool};

use super::{ListingCounts, ListingStore, MatchStore, PreferenceStore, UpsertOutcome};
use crate::models::{MatchRecord, NormalizedListing, UserPreferenceProfile};
use crate::utils::error::AppError;
use crate::Result;

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(FromRow)]
struct MatchRow {
    user_id: String,
    listing_id: String,
    score: i64,
    matched_criteria: Json<Vec<String>>,
    missed_criteria: Json<Vec<String>>,
    created_at: DateTime<Utc>,
}

impl From<MatchRow> for MatchRecord {
    fn from(row: MatchRow) -> Self {
        MatchRecord {
            user_id: row.user_id,
            listing_id: row.listing_id,
            score: row.score.clamp(0, 100) as u8,
            matched_criteria: row.matched_criteria.0,
            missed_criteria: row.missed_criteria.0,
            created_at: row.created_at,
        }
    }
}

fn persistence(context: &'static str) -> impl Fn(sqlx::Error) -> AppError {
    move |e| AppError::Persistence(format!("{}: {}", context, e))
}

fn decode_listings(rows: Vec<(String,)>) -> Result<Vec<NormalizedListing>> {
    rows.into_iter()
        .map(|(data,)| serde_json::from_str(&data).map_err(AppError::from))
        .collect()
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert or replace a preference profile. Profiles are owned elsewhere;
    /// this exists for the external profile service and for tests.
    pub async fn save_profile(&self, profile: &UserPreferenceProfile, is_active: bool) -> Result<()> {
        let data = serde_json::to_string(profile)?;
        sqlx::query(
            r#"
            INSERT INTO user_preferences (user_id, profile, is_active, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(user_id) DO UPDATE SET
                profile = excluded.profile,
                is_active = excluded.is_active,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&profile.user_id)
        .bind(data)
        .bind(is_active)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(persistence("save profile"))?;
        Ok(())
    }
}

#[async_trait]
impl ListingStore for SqliteStore {
    async fn upsert_listing(&self, listing: &NormalizedListing) -> Result<UpsertOutcome> {
        let data = serde_json::to_string(listing)?;
        let missing = listing.missing_categories().len() as i64;
        let total_rent = listing.costs.effective_total();

        // Keep this one write statement. A read followed by a write cannot
        // upgrade its lock while another connection is writing.
        // On conflict the document keeps the id and first_scraped_at of the
        // original insert.
        let (listing_id,): (String,) = sqlx::query_as(
            r#"
            INSERT INTO listings (id, source, external_id, url, total_rent, city, is_active,
                                  missing_count, data, first_scraped_at, last_scraped_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(source, external_id) DO UPDATE SET
                url = excluded.url,
                total_rent = excluded.total_rent,
                city = excluded.city,
                is_active = excluded.is_active,
                missing_count = excluded.missing_count,
                data = json_set(excluded.data,
                                '$.id', listings.id,
                                '$.first_scraped_at', listings.first_scraped_at),
                last_scraped_at = excluded.last_scraped_at
            RETURNING id
            "#,
        )
        .bind(&listing.id)
        .bind(&listing.source)
        .bind(&listing.external_id)
        .bind(&listing.url)
        .bind(total_rent)
        .bind(&listing.location.city)
        .bind(listing.is_active)
        .bind(missing)
        .bind(&data)
        .bind(listing.first_scraped_at)
        .bind(listing.scraped_at)
        .fetch_one(&self.pool)
        .await
        .map_err(persistence("upsert listing"))?;

        let inserted = listing_id == listing.id;

        tracing::debug!(
            source = %listing.source,
            external_id = %listing.external_id,
            inserted,
            "Upserted listing"
        );

        Ok(UpsertOutcome { listing_id, inserted })
    }

    async fn get_listing(&self, id: &str) -> Result<Option<NormalizedListing>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT data FROM listings WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some((data,)) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn find_stale(&self, older_than: DateTime<Utc>, limit: usize) -> Result<Vec<NormalizedListing>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT data FROM listings
            WHERE is_active = 1 AND last_scraped_at < ?1
            ORDER BY last_scraped_at ASC
            LIMIT ?2
            "#,
        )
        .bind(older_than)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        decode_listings(rows)
    }

    async fn find_incomplete(&self, older_than: DateTime<Utc>, limit: usize) -> Result<Vec<NormalizedListing>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT data FROM listings
            WHERE is_active = 1 AND missing_count > 0 AND last_scraped_at < ?1
            ORDER BY missing_count DESC, last_scraped_at ASC
            LIMIT ?2
            "#,
        )
        .bind(older_than)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        decode_listings(rows)
    }

    async fn listing_counts(&self) -> Result<ListingCounts> {
        let (total, active, incomplete): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(CASE WHEN is_active = 1 THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN is_active = 1 AND missing_count > 0 THEN 1 ELSE 0 END), 0)
            FROM listings
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(ListingCounts {
            total: total.max(0) as u64,
            active: active.max(0) as u64,
            incomplete: incomplete.max(0) as u64,
        })
    }
}

#[async_trait]
impl MatchStore for SqliteStore {
    async fn upsert_matches(&self, records: &[MatchRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.map_err(persistence("begin match upsert"))?;
        let now = Utc::now();
        let mut written = 0;

        for record in records {
            let result = sqlx::query(
                r#"
                INSERT INTO matches (user_id, listing_id, score, matched_criteria, missed_criteria,
                                     created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(user_id, listing_id) DO UPDATE SET
                    score = excluded.score,
                    matched_criteria = excluded.matched_criteria,
                    missed_criteria = excluded.missed_criteria,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&record.user_id)
            .bind(&record.listing_id)
            .bind(record.score as i64)
            .bind(serde_json::to_string(&record.matched_criteria)?)
            .bind(serde_json::to_string(&record.missed_criteria)?)
            .bind(record.created_at)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(persistence("upsert match"))?;
            written += result.rows_affected() as usize;
        }

        tx.commit().await.map_err(persistence("commit match upsert"))?;
        Ok(written)
    }

    async fn matches_for_user(&self, user_id: &str) -> Result<Vec<MatchRecord>> {
        let rows: Vec<MatchRow> = sqlx::query_as(
            r#"
            SELECT user_id, listing_id, score, matched_criteria, missed_criteria, created_at
            FROM matches
            WHERE user_id = ?1
            ORDER BY score DESC, listing_id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(MatchRecord::from).collect())
    }
}

#[async_trait]
impl PreferenceStore for SqliteStore {
    async fn active_profiles(&self) -> Result<Vec<UserPreferenceProfile>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT profile FROM user_preferences WHERE is_active = 1 ORDER BY user_id")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(data,)| serde_json::from_str(&data).map_err(AppError::from))
            .collect()
    }
}
