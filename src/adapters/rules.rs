//! Rule-only field extractor driven by per-platform selector packs.

use super::{ExtractError, ExtractorMode, FieldExtractor, PageContent};
use crate::dom;
use crate::normalize::RawFields;
use crate::platform::Platform;
use crate::urltools;
use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value, json};
use std::sync::LazyLock;

static JSON_LD_EMPLOYMENT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""employmentType"\s*:\s*"([^"]+)""#).unwrap());

static JSON_LD_DATE_POSTED_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""datePosted"\s*:\s*"([^"]+)""#).unwrap());

const SITE_NAME: &str = "meta[property=og:site_name]";

struct SelectorPack {
    title: &'static [&'static str],
    company: &'static [&'static str],
    location: &'static [&'static str],
    employment_type: &'static [&'static str],
}

fn pack_for(platform: Platform) -> SelectorPack {
    match platform {
        Platform::LinkedIn => SelectorPack {
            title: &["h1[data-test-job-title]", "h1.top-card-layout__title", "h1"],
            company: &[
                ".topcard__org-name-link",
                r#"a[data-tracking-control-name="public_jobs_topcard-org-name"]"#,
            ],
            location: &[".topcard__flavor--bullet", ".topcard__flavor--metadata"],
            employment_type: &[".description__job-criteria-text--employment-type"],
        },
        Platform::Lever => SelectorPack {
            title: &[".posting-headline h2", ".posting-header h2", "h1"],
            company: &[SITE_NAME],
            location: &[".posting-categories .location", ".location"],
            employment_type: &[".posting-categories .commitment"],
        },
        Platform::Greenhouse => SelectorPack {
            title: &["h1.app-title", "#content h1", "h1"],
            company: &[SITE_NAME, ".company-name"],
            location: &[".location", ".app-location"],
            employment_type: &[".employment-type"],
        },
        Platform::Generic => SelectorPack {
            title: &["h1"],
            company: &[SITE_NAME, ".company", ".company-name"],
            location: &[".location", "#location"],
            employment_type: &[".employment-type", "[itemprop=employmentType]"],
        },
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RuleExtractor {
    mode: ExtractorMode,
}

impl Default for RuleExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleExtractor {
    pub fn new() -> Self {
        Self {
            mode: ExtractorMode::Rules,
        }
    }

    /// Rule extraction standing in for a model-assisted extractor.
    pub fn degraded() -> Self {
        Self {
            mode: ExtractorMode::Degraded,
        }
    }

    pub fn extract_sync(&self, page: PageContent<'_>, platform: Platform) -> Result<RawFields, ExtractError> {
        let pack = pack_for(platform);
        let html = page.html;
        let mut provenance = Map::new();

        let mut pick = |field: &str, selectors: &[&'static str]| -> String {
            match dom::first_text(html, selectors) {
                Some((text, sel)) => {
                    provenance.insert(field.to_string(), Value::from(sel));
                    text
                }
                None => String::new(),
            }
        };

        let title = pick("title", pack.title);
        let mut company = pick("company", pack.company);
        let location = pick("location", pack.location);
        let mut employment_type = Some(pick("employment_type", pack.employment_type))
            .filter(|s| !s.is_empty());

        let description_roots = platform.description_roots();
        let description_text = match dom::first_text(html, description_roots) {
            Some((text, sel)) => {
                provenance.insert("description_root".into(), Value::from(sel));
                text
            }
            None => String::new(),
        };

        if company.is_empty() {
            company = company_from_url(page.url, platform);
            if !company.is_empty() {
                provenance.insert("company".into(), json!("url"));
            }
        }
        if employment_type.is_none()
            && let Some(caps) = JSON_LD_EMPLOYMENT_REGEX.captures(html)
        {
            employment_type = Some(caps[1].to_string());
            provenance.insert("employment_type".into(), json!("json_ld"));
        }

        let mut detected_fields = Map::new();
        detected_fields.insert("platform".into(), json!(platform.as_str()));
        if let Some(caps) = JSON_LD_DATE_POSTED_REGEX.captures(html) {
            detected_fields.insert("date_posted".into(), json!(&caps[1]));
        }

        let missing: Vec<&str> = [
            ("title", &title),
            ("company", &company),
            ("location", &location),
            ("description_text", &description_text),
        ]
        .iter()
        .filter(|(_, v)| v.is_empty())
        .map(|(k, _)| *k)
        .collect();
        provenance.insert("missing".into(), json!(missing));

        let fields = RawFields {
            title,
            company,
            location,
            employment_type,
            description_text,
            detected_fields,
            provenance,
        };
        if fields.title.is_empty() && fields.description_text.is_empty() {
            return Err(ExtractError::NoUsableContent(
                "neither a title nor a description was found".into(),
            ));
        }
        Ok(fields)
    }
}

/// Company name guessed from the URL: the board slug on hosted ATS pages,
/// otherwise the second-level domain.
fn company_from_url(url: &str, platform: Platform) -> String {
    let host = urltools::host(url);
    if matches!(platform, Platform::Lever | Platform::Greenhouse)
        && let Ok(parsed) = reqwest::Url::parse(url)
        && let Some(slug) = parsed.path_segments().and_then(|mut s| s.next())
        && !slug.is_empty()
    {
        return capitalize(slug);
    }
    let parts: Vec<&str> = host.split('.').collect();
    if parts.len() >= 2 {
        capitalize(parts[parts.len() - 2])
    } else {
        host
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[async_trait]
impl FieldExtractor for RuleExtractor {
    fn mode(&self) -> ExtractorMode {
        self.mode
    }

    async fn extract(
        &self,
        page: PageContent<'_>,
        platform: Platform,
    ) -> Result<RawFields, ExtractError> {
        self.extract_sync(page, platform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEVER_PAGE: &str = r#"<html><head>
        <meta property="og:site_name" content="Acme">
      </head><body><div class="posting">
        <div class="posting-headline"><h2>Backend Engineer</h2>
          <div class="posting-categories">
            <div class="location">Berlin,Germany</div>
            <div class="commitment">Full-time</div>
          </div>
        </div>
        <div class="section-wrapper description"><p>Build the <b>pipeline</b>.</p></div>
      </div></body></html>"#;

    fn page<'a>(url: &'a str, html: &'a str) -> PageContent<'a> {
        PageContent { url, html }
    }

    #[test]
    fn test_lever_pack() {
        let fields = RuleExtractor::new()
            .extract_sync(page("https://jobs.lever.co/acme/1", LEVER_PAGE), Platform::Lever)
            .unwrap();
        assert_eq!(fields.title, "Backend Engineer");
        assert_eq!(fields.company, "Acme");
        assert_eq!(fields.location, "Berlin,Germany");
        assert_eq!(fields.employment_type.as_deref(), Some("Full-time"));
        assert_eq!(fields.description_text, "Build the pipeline .");
        assert_eq!(fields.detected_fields["platform"], "lever");
        assert_eq!(fields.provenance["title"], ".posting-headline h2");
    }

    #[test]
    fn test_company_falls_back_to_url() {
        let html = "<h1>Engineer</h1><main>Do things</main>";
        let fields = RuleExtractor::new()
            .extract_sync(page("https://careers.example.com/jobs/1", html), Platform::Generic)
            .unwrap();
        assert_eq!(fields.company, "Example");

        let fields = RuleExtractor::new()
            .extract_sync(page("https://boards.greenhouse.io/acme/jobs/1", html), Platform::Greenhouse)
            .unwrap();
        assert_eq!(fields.company, "Acme");
        assert_eq!(fields.provenance["company"], "url");
    }

    #[test]
    fn test_json_ld_employment_type() {
        let html = r#"<h1>Engineer</h1><script type="application/ld+json">
            {"@type":"JobPosting","employmentType":"FULL_TIME","datePosted":"2026-01-02"}
        </script>"#;
        let fields = RuleExtractor::new()
            .extract_sync(page("https://example.com/j", html), Platform::Generic)
            .unwrap();
        assert_eq!(fields.employment_type.as_deref(), Some("FULL_TIME"));
        assert_eq!(fields.detected_fields["date_posted"], "2026-01-02");
    }

    #[test]
    fn test_empty_page_is_no_usable_content() {
        let err = RuleExtractor::new()
            .extract_sync(page("https://example.com/j", "<html><body></body></html>"), Platform::Generic)
            .unwrap_err();
        assert!(matches!(err, ExtractError::NoUsableContent(_)));
    }

    #[test]
    fn test_mode() {
        assert_eq!(RuleExtractor::new().mode(), ExtractorMode::Rules);
        assert_eq!(RuleExtractor::degraded().mode(), ExtractorMode::Degraded);
    }
}
