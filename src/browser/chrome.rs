use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use super::{BrowserSession, PageUnit, SessionFactory};
use crate::config::PoolConfig;
use crate::utils::error::AppError;
use crate::Result;

/// Launches one headless Chrome process per pooled session.
pub struct ChromeSessionFactory {
    config: PoolConfig,
}

pub struct ChromeSession {
    browser: Browser,
    user_agent: String,
}

pub struct ChromeTab {
    tab: Arc<Tab>,
}

impl ChromeSessionFactory {
    pub fn new(config: PoolConfig) -> Self {
        Self { config }
    }

    fn launch_options(&self) -> Result<LaunchOptions<'static>> {
        let mut launch_options = LaunchOptions::default_builder()
            .headless(self.config.headless)
            .sandbox(false) // Often needed in containerized environments
            .idle_browser_timeout(Duration::from_secs(self.config.session_timeout_secs.max(30) * 2))
            .args(vec![
                OsStr::new("--no-sandbox"),
                OsStr::new("--disable-dev-shm-usage"),
                OsStr::new("--disable-gpu"),
                OsStr::new("--disable-extensions"),
                OsStr::new("--disable-background-timer-throttling"),
                OsStr::new("--disable-backgrounding-occluded-windows"),
                OsStr::new("--disable-renderer-backgrounding"),
            ])
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create launch options: {}", e)))?;

        if let Some(chrome_path) = &self.config.chrome_path {
            launch_options.path = Some(std::path::PathBuf::from(chrome_path));
        }

        Ok(launch_options)
    }
}

#[async_trait]
impl SessionFactory for ChromeSessionFactory {
    async fn create(&self, source: &str) -> Result<Arc<dyn BrowserSession>> {
        let launch_options = self.launch_options()?;
        let browser = tokio::task::spawn_blocking(move || Browser::new(launch_options))
            .await?
            .map_err(|e| AppError::Internal(format!("Failed to launch browser: {}", e)))?;

        tracing::debug!(source = %source, "Launched headless browser");

        Ok(Arc::new(ChromeSession {
            browser,
            user_agent: self.config.user_agent.clone(),
        }))
    }
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn open_unit(&self) -> Result<Box<dyn PageUnit>> {
        let browser = self.browser.clone();
        let user_agent = self.user_agent.clone();

        let tab = tokio::task::spawn_blocking(move || -> std::result::Result<Arc<Tab>, String> {
            let tab = browser.new_tab().map_err(|e| format!("Failed to create tab: {}", e))?;
            tab.set_user_agent(&user_agent, None, None)
                .map_err(|e| format!("Failed to set user agent: {}", e))?;
            Ok(tab)
        })
        .await?
        .map_err(AppError::TransientFetch)?;

        Ok(Box::new(ChromeTab { tab }))
    }

    async fn close(&self) -> Result<()> {
        let browser = self.browser.clone();
        tokio::task::spawn_blocking(move || {
            // Closing every tab lets the browser process wind down; the
            // process itself is killed when the last handle is dropped.
            let tabs = browser
                .get_tabs()
                .lock()
                .map(|tabs| tabs.clone())
                .unwrap_or_default();
            for tab in tabs {
                let _ = tab.close(false);
            }
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PageUnit for ChromeTab {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<()> {
        let tab = Arc::clone(&self.tab);
        let target = url.to_string();

        let navigation = tokio::task::spawn_blocking(move || {
            tab.set_default_timeout(timeout);
            tab.navigate_to(&target)
                .and_then(|tab| tab.wait_until_navigated())
                .map(|_| ())
                .map_err(|e| format!("Navigation to {} failed: {}", target, e))
        });

        // The blocking call honours the tab timeout; the outer timeout covers
        // a wedged DevTools connection.
        match tokio::time::timeout(timeout + Duration::from_secs(5), navigation).await {
            Ok(joined) => joined?.map_err(AppError::TransientFetch),
            Err(_) => Err(AppError::TransientFetch(format!(
                "Navigation to {} timed out after {:?}",
                url, timeout
            ))),
        }
    }

    async fn content(&self) -> Result<String> {
        let tab = Arc::clone(&self.tab);
        tokio::task::spawn_blocking(move || tab.get_content())
            .await?
            .map_err(|e| AppError::TransientFetch(format!("Failed to get page content: {}", e)))
    }

    async fn current_url(&self) -> Result<String> {
        let tab = Arc::clone(&self.tab);
        Ok(tokio::task::spawn_blocking(move || tab.get_url()).await?)
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value> {
        let tab = Arc::clone(&self.tab);
        let script = script.to_string();
        let result = tokio::task::spawn_blocking(move || tab.evaluate(&script, false))
            .await?
            .map_err(|e| AppError::TransientFetch(format!("Script evaluation failed: {}", e)))?;
        Ok(result.value.unwrap_or(serde_json::Value::Null))
    }

    async fn close(&self) -> Result<()> {
        let tab = Arc::clone(&self.tab);
        tokio::task::spawn_blocking(move || tab.close(true))
            .await?
            .map(|_| ())
            .map_err(|e| AppError::Internal(format!("Failed to close tab: {}", e)))
    }
}
