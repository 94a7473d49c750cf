//! Plain HTTP page fetcher.
//!
//! Fetches the page once with the host's session cookies. It cannot execute
//! scripts, click or take screenshots, and says so in its capabilities.

use super::{
    Browser, BrowserCapabilities, BrowserError, ExpandOptions, ExpansionReport, Navigation,
    PageHandle, description_len,
};
use crate::dom;
use crate::session::SessionState;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub struct HttpBrowser {
    client: reqwest::Client,
    user_agent: String,
    pages: DashMap<u64, String>,
    next_id: AtomicU64,
}

impl HttpBrowser {
    pub fn new(user_agent: &str, nav_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(nav_timeout)
            .build()?;
        Ok(Self {
            client,
            user_agent: user_agent.to_string(),
            pages: DashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    fn page_html(&self, page: &PageHandle) -> Result<String, BrowserError> {
        self.pages
            .get(&page.0)
            .map(|html| html.clone())
            .ok_or_else(|| BrowserError::PageGone(page.clone()))
    }
}

#[async_trait]
impl Browser for HttpBrowser {
    fn capabilities(&self) -> BrowserCapabilities {
        BrowserCapabilities {
            screenshot: false,
            interactive: false,
        }
    }

    async fn navigate(
        &self,
        url: &str,
        session: Option<&SessionState>,
    ) -> Result<Navigation, BrowserError> {
        let mut request = self
            .client
            .get(url)
            .header("Accept", "text/html,application/xhtml+xml");
        if let Some(session) = session {
            if let Some(cookies) = session.cookie_header() {
                request = request.header("Cookie", cookies);
            }
            if let Some(ua) = session.user_agent.as_deref().filter(|ua| *ua != self.user_agent) {
                request = request.header("User-Agent", ua);
            }
        }

        let resp = request
            .send()
            .await
            .map_err(|e| BrowserError::Transient(format!("GET {}: {}", url, e)))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BrowserError::Status(status.as_u16()));
        }
        let final_url = resp.url().to_string();
        let html = resp
            .text()
            .await
            .map_err(|e| BrowserError::Transient(format!("reading body of {}: {}", url, e)))?;

        tracing::debug!(url, final_url = %final_url, bytes = html.len(), "fetched page");
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pages.insert(id, html);
        Ok(Navigation {
            final_url,
            page: PageHandle(id),
        })
    }

    async fn snapshot(&self, page: &PageHandle) -> Result<Vec<u8>, BrowserError> {
        self.page_html(page).map(String::into_bytes)
    }

    async fn capture(&self, _page: &PageHandle) -> Result<Vec<u8>, BrowserError> {
        Err(BrowserError::Unsupported("screenshots"))
    }

    async fn wait_for(
        &self,
        page: &PageHandle,
        selector: &str,
        _timeout: Duration,
    ) -> Result<bool, BrowserError> {
        Ok(dom::matches(&self.page_html(page)?, selector))
    }

    async fn scroll_to_bottom(&self, page: &PageHandle) -> Result<(), BrowserError> {
        self.page_html(page).map(|_| ())
    }

    async fn expand(
        &self,
        page: &PageHandle,
        options: &ExpandOptions,
    ) -> Result<ExpansionReport, BrowserError> {
        let html = self.page_html(page)?;
        let len = description_len(&html, &options.description_roots);
        Ok(ExpansionReport {
            expanded: false,
            clicks: 0,
            before_len: len,
            after_len: len,
            selectors_tried: Vec::new(),
        })
    }

    async fn close(&self, page: &PageHandle) {
        self.pages.remove(&page.0);
    }
}
