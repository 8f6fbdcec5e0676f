//! Heavy worker resources handed out by the resource pool.
//!
//! A [`BrowserSession`] is one browser process bound to a source; a
//! [`PageUnit`] is a tab checked out of it. Adapters only ever see units.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::Result;

pub mod chrome;

pub use chrome::ChromeSessionFactory;

#[async_trait]
pub trait PageUnit: Send + Sync {
    /// Load `url` and wait for navigation to finish, giving up after `timeout`.
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<()>;

    /// Serialized DOM of the current page.
    async fn content(&self) -> Result<String>;

    /// Final URL after redirects.
    async fn current_url(&self) -> Result<String>;

    /// Run a script in the page and return its JSON result.
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn open_unit(&self) -> Result<Box<dyn PageUnit>>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self, source: &str) -> Result<Arc<dyn BrowserSession>>;
}
