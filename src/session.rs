use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use futures::StreamExt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::Delays;
use crate::error::ScrapeError;

/// Which configured settle delay to block on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    PageLoad,
    DataLoad,
}

/// One browser navigation context, used for a single organisation visit.
///
/// Callers must invoke [`PageSession::close`] when done; implementations also
/// release the context on drop as a fallback.
#[async_trait]
pub trait PageSession: Send {
    async fn open(&mut self, url: &str) -> Result<(), ScrapeError>;

    async fn wait_fixed(&mut self, wait: Wait);

    async fn click(&mut self, selector: &str) -> Result<(), ScrapeError>;

    async fn attribute(&mut self, selector: &str, name: &str) -> Result<Option<String>, ScrapeError>;

    /// Serialized DOM as currently rendered.
    async fn rendered_html(&mut self) -> Result<String, ScrapeError>;

    /// URL actually displayed after navigation (may differ from the requested one).
    fn current_url(&self) -> &str;

    async fn close(&mut self);

    /// Switch the displayed reporting period and let the data settle.
    async fn select_time_window(&mut self, control: &str) -> Result<(), ScrapeError> {
        self.click(control).await?;
        self.wait_fixed(Wait::DataLoad).await;
        Ok(())
    }
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn new_session(&self) -> Result<Box<dyn PageSession>, ScrapeError>;
}

/// Headless Chromium shared by every session of a run.
pub struct ChromeBrowser {
    browser: Browser,
    delays: Delays,
}

impl ChromeBrowser {
    pub async fn launch(headless: bool, delays: Delays) -> anyhow::Result<Self> {
        info!("Initializing browser");

        let mut config = BrowserConfig::builder();
        if !headless {
            config = config.with_head();
        }
        config = config.window_size(1920, 1080);
        config = config.viewport(None);

        let browser_config = config
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build browser config: {}", e))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to launch browser: {}", e))?;

        tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if let Err(e) = h {
                    error!("Browser handler error: {:?}", e);
                }
            }
        });

        Ok(Self { browser, delays })
    }

    pub async fn close(mut self) -> anyhow::Result<()> {
        self.browser.close().await?;
        Ok(())
    }
}

#[async_trait]
impl SessionFactory for ChromeBrowser {
    async fn new_session(&self) -> Result<Box<dyn PageSession>, ScrapeError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| ScrapeError::Browser(e.to_string()))?;
        Ok(Box::new(ChromeSession {
            page: Some(page),
            delays: self.delays.clone(),
            url: String::new(),
        }))
    }
}

pub struct ChromeSession {
    page: Option<Page>,
    delays: Delays,
    url: String,
}

impl ChromeSession {
    fn page(&self) -> Result<&Page, ScrapeError> {
        self.page
            .as_ref()
            .ok_or_else(|| ScrapeError::Browser("session already closed".to_string()))
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = Result<T, ScrapeError>>,
    ) -> Result<T, ScrapeError> {
        let timeout = self.delays.navigation_timeout();
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| ScrapeError::Timeout {
                operation: operation.to_string(),
                timeout,
            })?
    }
}

#[async_trait]
impl PageSession for ChromeSession {
    async fn open(&mut self, url: &str) -> Result<(), ScrapeError> {
        let page = self.page()?.clone();
        let navigation = async {
            page.goto(url).await.map_err(|e| ScrapeError::Navigation {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
            page.url()
                .await
                .map_err(|e| ScrapeError::Browser(e.to_string()))
        };
        let landed = self.bounded(&format!("loading {url}"), navigation).await?;
        self.url = landed.unwrap_or_else(|| url.to_string());
        debug!("Opened {}", self.url);
        Ok(())
    }

    async fn wait_fixed(&mut self, wait: Wait) {
        let delay = match wait {
            Wait::PageLoad => self.delays.page_load(),
            Wait::DataLoad => self.delays.data_load(),
        };
        tokio::time::sleep(delay).await;
    }

    async fn click(&mut self, selector: &str) -> Result<(), ScrapeError> {
        let page = self.page()?.clone();
        let action = async {
            let element = page
                .find_element(selector)
                .await
                .map_err(|_| ScrapeError::element_not_found(selector))?;
            element
                .scroll_into_view()
                .await
                .map_err(|e| ScrapeError::Browser(e.to_string()))?;
            element
                .click()
                .await
                .map_err(|e| ScrapeError::Browser(e.to_string()))?;
            Ok(())
        };
        self.bounded(&format!("clicking {selector}"), action).await
    }

    async fn attribute(&mut self, selector: &str, name: &str) -> Result<Option<String>, ScrapeError> {
        let page = self.page()?.clone();
        let lookup = async {
            let element = page
                .find_element(selector)
                .await
                .map_err(|_| ScrapeError::element_not_found(selector))?;
            element
                .attribute(name)
                .await
                .map_err(|e| ScrapeError::Browser(e.to_string()))
        };
        self.bounded(&format!("reading {selector}@{name}"), lookup).await
    }

    async fn rendered_html(&mut self) -> Result<String, ScrapeError> {
        let page = self.page()?.clone();
        let content = async {
            page.content()
                .await
                .map_err(|e| ScrapeError::Browser(e.to_string()))
        };
        self.bounded("reading page content", content).await
    }

    fn current_url(&self) -> &str {
        &self.url
    }

    async fn close(&mut self) {
        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                warn!("Failed to close page {}: {}", self.url, e);
            }
        }
    }
}

impl Drop for ChromeSession {
    fn drop(&mut self) {
        let Some(page) = self.page.take() else {
            return;
        };
        warn!("Session for {} dropped without close, closing page", self.url);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = page.close().await;
            });
        }
    }
}
