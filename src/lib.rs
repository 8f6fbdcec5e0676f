pub mod adapters;
pub mod browser;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod events;
pub mod matching;
pub mod models;
pub mod pool;
pub mod queue;
pub mod store;
pub mod utils;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use adapters::{AdapterRegistry, RawDetail, RawTarget, SourceAdapter};
pub use browser::{BrowserSession, PageUnit, SessionFactory};
pub use config::AppConfig;
pub use coordinator::{Coordinator, CoordinatorDeps, CoordinatorStats};
pub use events::{CrawlEvent, EventBus};
pub use matching::MatchEngine;
pub use pool::ResourcePool;
pub use queue::WorkQueue;
pub use store::SqliteStore;
pub use utils::error::AppError;

pub type Result<T> = std::result::Result<T, AppError>;
