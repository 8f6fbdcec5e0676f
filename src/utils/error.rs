use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Network or page level failure; retried through the queue's attempt counter.
    #[error("Fetch error: {0}")]
    TransientFetch(String),

    #[error("Blocked by {source_id}: {url}")]
    Blocked { source_id: String, url: String },

    #[error("Authentication failed for {source_id}: {message}")]
    Authentication { source_id: String, message: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Timed out after {waited_ms}ms waiting for a session for {source_id}")]
    AcquireTimeout { source_id: String, waited_ms: u64 },

    #[error("Resource pool is shut down")]
    PoolShutdown,

    #[error("Adapter error: {source_id}: {message}")]
    Adapter { source_id: String, message: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether another attempt at the same work item could succeed. Queue
    /// items failing with anything else are failed without further retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::TransientFetch(_)
                | AppError::AcquireTimeout { .. }
                | AppError::Authentication { .. }
                | AppError::Database(_)
                | AppError::Persistence(_)
                | AppError::PoolShutdown
                | AppError::Io(_)
                | AppError::Internal(_)
        )
    }

    /// Short machine-friendly label used in logs, metrics and the error buffer.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Database(_) => "database",
            AppError::Config(_) | AppError::Configuration(_) => "configuration",
            AppError::Serialization(_) => "serialization",
            AppError::Io(_) => "io",
            AppError::TransientFetch(_) => "fetch",
            AppError::Blocked { .. } => "blocked",
            AppError::Authentication { .. } => "authentication",
            AppError::Persistence(_) => "persistence",
            AppError::AcquireTimeout { .. } => "acquire_timeout",
            AppError::PoolShutdown => "pool_shutdown",
            AppError::Adapter { .. } => "adapter",
            AppError::Validation(_) => "validation",
            AppError::NotFound { .. } => "not_found",
            AppError::Internal(_) => "internal",
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::Validation(format!("{}", err))
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        AppError::Internal(format!("Background task failed: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
