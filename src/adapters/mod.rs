//! Collaborator contracts consumed by the run orchestrator, and the default
//! implementations shipped with the crate.
//!
//! The orchestrator only talks to `dyn Browser`, `dyn PlatformDetector` and
//! `dyn FieldExtractor`; swapping the page-rendering layer or the extractor
//! never touches the run state machine.

use crate::errors::StepError;
use crate::normalize::RawFields;
use crate::platform::Platform;
use crate::session::SessionState;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

pub mod fixture;
pub mod http;
pub mod rules;

pub use fixture::FixtureBrowser;
pub use http::HttpBrowser;
pub use rules::RuleExtractor;

/// Opaque reference to a page opened by a [`Browser`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageHandle(pub u64);

#[derive(Debug, Clone)]
pub struct Navigation {
    pub final_url: String,
    pub page: PageHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BrowserCapabilities {
    pub screenshot: bool,
    pub interactive: bool,
}

/// Parameters of a description expansion pass.
#[derive(Debug, Clone)]
pub struct ExpandOptions {
    pub selectors: Vec<String>,
    pub description_roots: Vec<String>,
    pub max_clicks: u32,
    pub stabilize: Duration,
    pub min_delta_chars: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExpansionReport {
    pub expanded: bool,
    pub clicks: u32,
    pub before_len: usize,
    pub after_len: usize,
    pub selectors_tried: Vec<String>,
}

#[derive(Debug, Clone, Error)]
pub enum BrowserError {
    #[error("browser I/O failed: {0}")]
    Transient(String),

    #[error("page {0:?} is not open")]
    PageGone(PageHandle),

    #[error("server answered HTTP {0}")]
    Status(u16),

    #[error("browser does not support {0}")]
    Unsupported(&'static str),
}

impl From<BrowserError> for StepError {
    fn from(err: BrowserError) -> Self {
        match err {
            BrowserError::Transient(_) | BrowserError::PageGone(_) => {
                StepError::Transient(err.to_string())
            }
            BrowserError::Status(code) if code == 429 || code >= 500 => {
                StepError::Transient(err.to_string())
            }
            BrowserError::Status(_) | BrowserError::Unsupported(_) => {
                StepError::Fatal(err.to_string())
            }
        }
    }
}

/// Page-rendering layer.
#[async_trait]
pub trait Browser: Send + Sync {
    fn capabilities(&self) -> BrowserCapabilities;

    async fn navigate(
        &self,
        url: &str,
        session: Option<&SessionState>,
    ) -> Result<Navigation, BrowserError>;

    /// Current HTML of the page.
    async fn snapshot(&self, page: &PageHandle) -> Result<Vec<u8>, BrowserError>;

    /// PNG screenshot of the page.
    async fn capture(&self, page: &PageHandle) -> Result<Vec<u8>, BrowserError>;

    /// Wait until `selector` is present; `false` on timeout.
    async fn wait_for(
        &self,
        page: &PageHandle,
        selector: &str,
        timeout: Duration,
    ) -> Result<bool, BrowserError>;

    async fn scroll_to_bottom(&self, page: &PageHandle) -> Result<(), BrowserError>;

    /// Click expansion controls inside the description.
    async fn expand(
        &self,
        page: &PageHandle,
        options: &ExpandOptions,
    ) -> Result<ExpansionReport, BrowserError>;

    async fn close(&self, _page: &PageHandle) {}
}

/// Result of probing a page for its platform.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub platform: Platform,
    pub confidence: f64,
    pub matched_selectors: Vec<String>,
}

#[derive(Debug, Clone, Error)]
pub enum DetectionError {
    #[error("platform detection is ambiguous between {candidates:?}")]
    Ambiguous { candidates: Vec<Platform> },

    #[error("platform probe failed: {0}")]
    Probe(String),
}

#[async_trait]
pub trait PlatformDetector: Send + Sync {
    async fn probe(&self, url: &str, html: &str) -> Result<Detection, DetectionError>;
}

/// Page content handed to a field extractor.
#[derive(Debug, Clone)]
pub struct PageContent<'a> {
    pub url: &'a str,
    pub html: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractorMode {
    /// Rule-based extraction only.
    Rules,
    /// Model-assisted extraction was requested but no backend exists, so
    /// rules ran instead.
    Degraded,
}

#[derive(Debug, Clone, Error)]
pub enum ExtractError {
    #[error("no usable content: {0}")]
    NoUsableContent(String),

    #[error("extractor backend unavailable: {0}")]
    Unavailable(String),

    #[error("extractor returned invalid output: {0}")]
    Invalid(String),
}

impl From<ExtractError> for StepError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::Unavailable(_) => StepError::Transient(err.to_string()),
            ExtractError::NoUsableContent(_) | ExtractError::Invalid(_) => {
                StepError::Extraction(err.to_string())
            }
        }
    }
}

/// Length of the description text under the first matching root.
pub(crate) fn description_len(html: &str, roots: &[String]) -> usize {
    let roots: Vec<&str> = roots.iter().map(String::as_str).collect();
    crate::dom::first_text(html, &roots).map_or(0, |(text, _)| text.chars().count())
}

#[async_trait]
pub trait FieldExtractor: Send + Sync {
    fn mode(&self) -> ExtractorMode;

    async fn extract(
        &self,
        page: PageContent<'_>,
        platform: Platform,
    ) -> Result<RawFields, ExtractError>;
}
