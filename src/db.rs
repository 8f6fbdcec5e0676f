use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

use crate::config::DatabaseConfig;
use crate::Result;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS queue_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source TEXT NOT NULL,
        url TEXT NOT NULL,
        listing_id TEXT,
        priority INTEGER NOT NULL DEFAULT 0,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_attempt_at TEXT,
        status TEXT NOT NULL DEFAULT 'pending',
        data_needed TEXT NOT NULL DEFAULT '[]',
        metadata TEXT NOT NULL,
        last_error TEXT,
        result TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        completed_at TEXT,
        UNIQUE (source, url)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_queue_items_dispatch ON queue_items (status, priority DESC, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS listings (
        id TEXT PRIMARY KEY,
        source TEXT NOT NULL,
        external_id TEXT NOT NULL,
        url TEXT NOT NULL,
        total_rent REAL,
        city TEXT,
        is_active INTEGER NOT NULL DEFAULT 1,
        missing_count INTEGER NOT NULL DEFAULT 0,
        data TEXT NOT NULL,
        first_scraped_at TEXT NOT NULL,
        last_scraped_at TEXT NOT NULL,
        UNIQUE (source, external_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_listings_freshness ON listings (is_active, last_scraped_at)",
    r#"
    CREATE TABLE IF NOT EXISTS matches (
        user_id TEXT NOT NULL,
        listing_id TEXT NOT NULL,
        score INTEGER NOT NULL,
        matched_criteria TEXT NOT NULL,
        missed_criteria TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (user_id, listing_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_preferences (
        user_id TEXT PRIMARY KEY,
        profile TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        updated_at TEXT NOT NULL
    )
    "#,
];

/// Open a connection pool for the configured database, creating the file if needed.
pub async fn connect(config: &DatabaseConfig) -> Result<SqlitePool> {
    let in_memory = config.url.contains(":memory:");
    let mut options = SqliteConnectOptions::from_str(&config.url)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(10));
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    // every connection to an in-memory database is a separate database,
    // so keep exactly one and never recycle it
    let max_connections = if in_memory { 1 } else { config.max_connections };

    let mut pool_options = SqlitePoolOptions::new().max_connections(max_connections);
    if in_memory {
        pool_options = pool_options.idle_timeout(None).max_lifetime(None);
    }
    let pool = pool_options.connect_with(options).await?;

    tracing::debug!(url = %config.url, max_connections, "Connected to database");
    Ok(pool)
}

/// Create all tables and indexes. Safe to run on every start.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// In-memory database with the schema applied, for tests and dry runs.
pub async fn memory_pool() -> Result<SqlitePool> {
    let pool = connect(&DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        max_connections: 1,
    })
    .await?;
    migrate(&pool).await?;
    Ok(pool)
}
