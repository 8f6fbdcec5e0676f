use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Limits and timings for pooled browser sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_sessions_per_source: usize,
    pub max_total_sessions: usize,
    pub max_units_per_session: usize,
    pub session_timeout_secs: u64,
    pub auth_lifetime_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_release_errors: u32,
    pub acquire_timeout_secs: u64,
    pub headless: bool,
    pub user_agent: String,
    pub chrome_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub retention_days: u32,
    pub stale_after_hours: u64,
    /// Minimum age before an incomplete listing or a failed row is tried again.
    pub rescan_after_hours: u64,
    pub rescan_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub max_concurrent_sources: usize,
    pub discovery_interval_minutes: u64,
    pub update_interval_minutes: u64,
    pub health_interval_minutes: u64,
    pub auto_discovery: bool,
    pub auto_matching: bool,
    pub auto_cleanup: bool,
    pub item_timeout_secs: u64,
    pub failure_ratio_threshold: f64,
    pub stuck_processing_threshold: u64,
    pub stuck_after_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub weights: ScoreWeights,
    pub default_min_score: u8,
}

/// Relative weight of each sub-score in the composite match score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub price: f64,
    pub location: f64,
    pub size: f64,
    pub amenities: f64,
    pub availability: f64,
    pub property_type: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub enabled: bool,
    /// Added to the priority of every target from this source.
    #[serde(default)]
    pub weight: i64,
    /// Pause between two items of this source within one update cycle.
    #[serde(default)]
    pub request_delay_ms: u64,
    #[serde(default)]
    pub requires_auth: bool,
    #[serde(default)]
    pub credentials: Option<SourceCredentials>,
    /// Search filters handed to the adapter when building discovery targets.
    #[serde(default)]
    pub filters: HashMap<String, String>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SourceCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for SourceCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/rentwatch.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_source: 2,
            max_total_sessions: 6,
            max_units_per_session: 3,
            session_timeout_secs: 600,
            auth_lifetime_secs: 3600,
            sweep_interval_secs: 60,
            max_release_errors: 3,
            acquire_timeout_secs: 120,
            headless: true,
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36".to_string(),
            chrome_path: None,
        }
    }
}

impl PoolConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn auth_lifetime(&self) -> Duration {
        Duration::from_secs(self.auth_lifetime_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_retries: 3,
            retry_delay_secs: 300,
            retention_days: 7,
            stale_after_hours: 24,
            rescan_after_hours: 6,
            rescan_limit: 200,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sources: 3,
            discovery_interval_minutes: 60,
            update_interval_minutes: 5,
            health_interval_minutes: 10,
            auto_discovery: true,
            auto_matching: true,
            auto_cleanup: true,
            item_timeout_secs: 60,
            failure_ratio_threshold: 0.5,
            stuck_processing_threshold: 20,
            stuck_after_minutes: 30,
        }
    }
}

impl CoordinatorConfig {
    pub fn item_timeout(&self) -> Duration {
        Duration::from_secs(self.item_timeout_secs)
    }
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            default_min_score: 60,
        }
    }
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            price: 0.35,
            location: 0.30,
            size: 0.15,
            amenities: 0.10,
            availability: 0.05,
            property_type: 0.05,
        }
    }
}

impl ScoreWeights {
    pub fn total(&self) -> f64 {
        self.price + self.location + self.size + self.amenities + self.availability + self.property_type
    }
}

impl SourceConfig {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            enabled: true,
            weight: 0,
            request_delay_ms: 0,
            requires_auth: false,
            credentials: None,
            filters: HashMap::new(),
        }
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Start with default configuration
            .add_source(File::with_name("config/default").required(false))
            // Add environment-specific config
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Add local config (ignored by git)
            .add_source(File::with_name("config/local").required(false))
            // Add environment variables with prefix "RENTWATCH_"
            .add_source(Environment::with_prefix("RENTWATCH").separator("__"))
            .build()?;

        let mut config: AppConfig = s.try_deserialize()?;

        if config.pool.chrome_path.is_none() {
            config.pool.chrome_path = env::var("CHROME_PATH").ok();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn source(&self, id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.id == id)
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    /// Per-source priority weights for the work queue.
    pub fn source_weights(&self) -> HashMap<String, i64> {
        self.sources.iter().map(|s| (s.id.clone(), s.weight)).collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.is_empty() {
            return Err(ConfigError::Message("Database url must be set".into()));
        }

        if self.database.max_connections == 0 {
            return Err(ConfigError::Message("Database max_connections must be greater than 0".into()));
        }

        // Pool limits
        if self.pool.max_sessions_per_source == 0 || self.pool.max_total_sessions == 0 {
            return Err(ConfigError::Message("Pool session caps must be greater than 0".into()));
        }

        if self.pool.max_units_per_session == 0 {
            return Err(ConfigError::Message("Pool max_units_per_session must be greater than 0".into()));
        }

        if self.pool.max_sessions_per_source > self.pool.max_total_sessions {
            return Err(ConfigError::Message(
                "Pool max_sessions_per_source cannot exceed max_total_sessions".into(),
            ));
        }

        if self.pool.sweep_interval_secs == 0 {
            return Err(ConfigError::Message("Pool sweep_interval_secs must be greater than 0".into()));
        }

        // Queue
        if self.queue.batch_size == 0 {
            return Err(ConfigError::Message("Queue batch_size must be greater than 0".into()));
        }

        if self.queue.max_retries == 0 {
            return Err(ConfigError::Message("Queue max_retries must be greater than 0".into()));
        }

        // Coordinator
        let c = &self.coordinator;
        if c.max_concurrent_sources == 0 {
            return Err(ConfigError::Message(
                "Coordinator max_concurrent_sources must be greater than 0".into(),
            ));
        }

        if c.discovery_interval_minutes == 0 || c.update_interval_minutes == 0 || c.health_interval_minutes == 0 {
            return Err(ConfigError::Message("Coordinator intervals must be greater than 0".into()));
        }

        if c.item_timeout_secs == 0 {
            return Err(ConfigError::Message("Coordinator item_timeout_secs must be greater than 0".into()));
        }

        if !(0.0..=1.0).contains(&c.failure_ratio_threshold) {
            return Err(ConfigError::Message(
                "Coordinator failure_ratio_threshold must be between 0 and 1".into(),
            ));
        }

        // Matching
        if (self.matching.weights.total() - 1.0).abs() > 1e-6 {
            return Err(ConfigError::Message("Matching weights must sum to 1".into()));
        }

        if self.matching.default_min_score > 100 {
            return Err(ConfigError::Message("Matching default_min_score must be at most 100".into()));
        }

        // Sources
        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.id.trim().is_empty() {
                return Err(ConfigError::Message("Source id must not be empty".into()));
            }
            if !seen.insert(source.id.as_str()) {
                return Err(ConfigError::Message(format!("Duplicate source id: {}", source.id)));
            }
            if source.enabled && source.requires_auth && source.credentials.is_none() {
                return Err(ConfigError::Message(format!(
                    "Source {} requires authentication but has no credentials",
                    source.id
                )));
            }
        }

        Ok(())
    }
}
