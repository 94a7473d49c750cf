//! Job-board platform variants and the heuristic detector.

use crate::adapters::{Detection, DetectionError, PlatformDetector};
use crate::dom;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

static LINKEDIN_URL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(www\.)?linkedin\.com/jobs/view").unwrap());

static LEVER_URL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)jobs\.lever\.co/").unwrap());

static GREENHOUSE_URL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(boards\.|job-boards\.)?greenhouse\.io/").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    #[serde(rename = "linkedin")]
    LinkedIn,
    Lever,
    Greenhouse,
    Generic,
}

impl Platform {
    /// Specific platforms, in probing order.
    pub const SPECIFIC: [Platform; 3] = [Platform::LinkedIn, Platform::Lever, Platform::Greenhouse];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LinkedIn => "linkedin",
            Self::Lever => "lever",
            Self::Greenhouse => "greenhouse",
            Self::Generic => "generic",
        }
    }

    pub fn matches_url(&self, url: &str) -> bool {
        match self {
            Self::LinkedIn => LINKEDIN_URL_REGEX.is_match(url),
            Self::Lever => LEVER_URL_REGEX.is_match(url),
            Self::Greenhouse => GREENHOUSE_URL_REGEX.is_match(url),
            Self::Generic => true,
        }
    }

    /// Selectors whose presence indicates this platform's job page.
    pub fn dom_probes(&self) -> &'static [&'static str] {
        match self {
            Self::LinkedIn => &[
                "h1[data-test-job-title]",
                "h1.top-card-layout__title",
                r#"[data-test="job-details"]"#,
                ".top-card-layout__entity-info",
            ],
            Self::Lever => &[
                ".posting-headline h2",
                ".posting-header h2",
                ".posting-categories .location",
                ".posting",
            ],
            Self::Greenhouse => &["h1.app-title", "#content h1", ".opening .title", ".job h1"],
            Self::Generic => &[],
        }
    }

    /// Probes that match `html`.
    pub fn dom_hits(&self, html: &str) -> Vec<&'static str> {
        self.dom_probes()
            .iter()
            .copied()
            .filter(|sel| dom::matches(html, sel))
            .collect()
    }

    pub fn matches_dom(&self, html: &str) -> bool {
        match self {
            Self::Generic => true,
            _ => !self.dom_hits(html).is_empty(),
        }
    }

    /// Default "show more" controls clicked to reveal a collapsed description.
    pub fn expansion_selectors(&self) -> &'static [&'static str] {
        match self {
            Self::LinkedIn => &[
                "button.show-more-less-html__button--more",
                "button.show-more-less-html__button",
                "button.jobs-description__footer-button",
            ],
            Self::Lever => &[],
            Self::Greenhouse => &[],
            Self::Generic => &["button.show-more", "button.read-more", "[data-expand]"],
        }
    }

    /// Elements that hold the job description, most specific first.
    pub fn description_roots(&self) -> &'static [&'static str] {
        match self {
            Self::LinkedIn => &[
                "div.show-more-less-html__markup",
                "#job-details",
                ".jobs-description__content",
                ".description__text",
            ],
            Self::Lever => &[".section-wrapper.description", ".section.description", ".content", ".posting"],
            Self::Greenhouse => &["#content", ".opening", ".job"],
            Self::Generic => &["main", "article", "#content", ".content", "body"],
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linkedin" => Ok(Self::LinkedIn),
            "lever" => Ok(Self::Lever),
            "greenhouse" => Ok(Self::Greenhouse),
            "generic" | "other" => Ok(Self::Generic),
            _ => Err(format!("Invalid platform: {}", s)),
        }
    }
}

/// URL patterns combined with DOM probes.
///
/// DOM evidence wins over the URL; a tie between two platforms' DOM hits is
/// reported as ambiguous.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicDetector;

impl HeuristicDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn detect(&self, url: &str, html: &str) -> Result<Detection, DetectionError> {
        let mut scored: Vec<(Platform, Vec<&'static str>)> = Platform::SPECIFIC
            .iter()
            .map(|p| (*p, p.dom_hits(html)))
            .filter(|(_, hits)| !hits.is_empty())
            .collect();
        scored.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

        let url_guess = Platform::SPECIFIC
            .iter()
            .copied()
            .find(|p| p.matches_url(url));

        let Some((best, best_hits)) = scored.first() else {
            return Ok(match url_guess {
                Some(platform) => Detection {
                    platform,
                    confidence: 0.5,
                    matched_selectors: Vec::new(),
                },
                None => Detection {
                    platform: Platform::Generic,
                    confidence: 0.1,
                    matched_selectors: Vec::new(),
                },
            });
        };

        let tied: Vec<Platform> = scored
            .iter()
            .filter(|(_, hits)| hits.len() == best_hits.len())
            .map(|(p, _)| *p)
            .collect();
        if tied.len() > 1 {
            // The URL can settle a tie between DOM candidates.
            if let Some(platform) = url_guess.filter(|p| tied.contains(p)) {
                let hits = scored
                    .iter()
                    .find(|(p, _)| *p == platform)
                    .map(|(_, h)| h.clone())
                    .unwrap_or_default();
                return Ok(Detection {
                    platform,
                    confidence: 0.5,
                    matched_selectors: hits.iter().map(|s| s.to_string()).collect(),
                });
            }
            return Err(DetectionError::Ambiguous { candidates: tied });
        }

        let total: usize = scored.iter().map(|(_, hits)| hits.len()).sum();
        Ok(Detection {
            platform: *best,
            confidence: best_hits.len() as f64 / total.max(1) as f64,
            matched_selectors: scored
                .iter()
                .flat_map(|(_, hits)| hits.iter().map(|s| s.to_string()))
                .collect(),
        })
    }
}

#[async_trait]
impl PlatformDetector for HeuristicDetector {
    async fn probe(&self, url: &str, html: &str) -> Result<Detection, DetectionError> {
        self.detect(url, html)
    }
}
