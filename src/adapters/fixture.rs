//! Offline browser that serves a local HTML file as every page.

use super::{
    Browser, BrowserCapabilities, BrowserError, ExpandOptions, ExpansionReport, Navigation,
    PageHandle, description_len,
};
use crate::dom;
use crate::session::SessionState;
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// 1×1 transparent PNG returned by [`FixtureBrowser::capture`].
pub const BLANK_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F, 0x15, 0xC4,
    0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00, 0x01, 0x00, 0x00,
    0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, 0xAE,
    0x42, 0x60, 0x82,
];

enum Source {
    File(PathBuf),
    Inline(String),
}

pub struct FixtureBrowser {
    source: Source,
    pages: DashMap<u64, String>,
    next_id: AtomicU64,
}

impl FixtureBrowser {
    /// Serve the contents of `path`, re-read on every navigation.
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self::with_source(Source::File(path.into()))
    }

    pub fn from_html(html: impl Into<String>) -> Self {
        Self::with_source(Source::Inline(html.into()))
    }

    fn with_source(source: Source) -> Self {
        Self {
            source,
            pages: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn page_html(&self, page: &PageHandle) -> Result<String, BrowserError> {
        self.pages
            .get(&page.0)
            .map(|html| html.clone())
            .ok_or_else(|| BrowserError::PageGone(page.clone()))
    }
}

#[async_trait]
impl Browser for FixtureBrowser {
    fn capabilities(&self) -> BrowserCapabilities {
        BrowserCapabilities {
            screenshot: true,
            interactive: false,
        }
    }

    async fn navigate(
        &self,
        url: &str,
        _session: Option<&SessionState>,
    ) -> Result<Navigation, BrowserError> {
        let html = match &self.source {
            Source::File(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
                BrowserError::Transient(format!("reading fixture {}: {}", path.display(), e))
            })?,
            Source::Inline(html) => html.clone(),
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pages.insert(id, html);
        Ok(Navigation {
            final_url: url.to_string(),
            page: PageHandle(id),
        })
    }

    async fn snapshot(&self, page: &PageHandle) -> Result<Vec<u8>, BrowserError> {
        self.page_html(page).map(String::into_bytes)
    }

    async fn capture(&self, page: &PageHandle) -> Result<Vec<u8>, BrowserError> {
        self.page_html(page)?;
        Ok(BLANK_PNG.to_vec())
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

    /// Static markup cannot be clicked; matching controls are reported as
    /// tried and the description length is left unchanged.
    async fn expand(
        &self,
        page: &PageHandle,
        options: &ExpandOptions,
    ) -> Result<ExpansionReport, BrowserError> {
        let html = self.page_html(page)?;
        let len = description_len(&html, &options.description_roots);
        let selectors_tried = options
            .selectors
            .iter()
            .filter(|sel| dom::matches(&html, sel))
            .take(options.max_clicks as usize)
            .cloned()
            .collect();
        Ok(ExpansionReport {
            expanded: false,
            clicks: 0,
            before_len: len,
            after_len: len,
            selectors_tried,
        })
    }

    async fn close(&self, page: &PageHandle) {
        self.pages.remove(&page.0);
    }
}
