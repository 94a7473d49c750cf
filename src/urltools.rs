//! URL canonicalization.

use regex::Regex;
use reqwest::Url;
use std::sync::LazyLock;

static CANONICAL_LINK_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?is)<link\b[^>]*\brel\s*=\s*["']canonical["'][^>]*>"#).unwrap());

static OG_URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<meta\b[^>]*\bproperty\s*=\s*["']og:url["'][^>]*>"#).unwrap()
});

static HREF_ATTR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?is)\bhref\s*=\s*["']([^"']+)["']"#).unwrap());

static CONTENT_ATTR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?is)\bcontent\s*=\s*["']([^"']+)["']"#).unwrap());

/// Lower-cased host of `url`, or an empty string.
pub fn host(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        .unwrap_or_default()
}

/// Stable representative form of a job URL.
///
/// LinkedIn recommendation links collapse to the `/jobs/view/<id>/` page.
/// Every other URL loses its query, fragment and trailing slash. Input that
/// does not parse as an absolute URL is returned unchanged.
pub fn canonicalize(url: &str) -> String {
    let Ok(parsed) = Url::parse(url.trim()) else {
        return url.to_string();
    };
    if parsed.cannot_be_a_base() {
        return url.to_string();
    }

    let host = parsed.host_str().unwrap_or_default();
    if host == "linkedin.com" || host.ends_with(".linkedin.com") {
        let path = parsed.path();
        if path.contains("/jobs/collections/recommended")
            && let Some((_, job_id)) = parsed
                .query_pairs()
                .find(|(k, v)| k == "currentJobId" && !v.is_empty())
        {
            return format!("https://www.linkedin.com/jobs/view/{}/", job_id);
        }
        if path.contains("/jobs/view/") {
            let path = if path.ends_with('/') {
                path.to_string()
            } else {
                format!("{}/", path)
            };
            return format!("{}://{}{}", parsed.scheme(), authority(&parsed), path);
        }
    }

    format!(
        "{}://{}{}",
        parsed.scheme(),
        authority(&parsed),
        parsed.path().trim_end_matches('/')
    )
}

/// Drop query string and fragment.
pub fn strip_tracking(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}

/// The page's declared canonical URL (`<link rel="canonical">`, then
/// `og:url`), if it lives on the same host as `page_url`.
pub fn meta_canonical(html: &str, page_url: &str) -> Option<String> {
    let base = Url::parse(page_url).ok()?;
    let current_host = base.host_str()?.to_ascii_lowercase();

    let candidate = CANONICAL_LINK_REGEX
        .find(html)
        .and_then(|tag| HREF_ATTR_REGEX.captures(tag.as_str()))
        .or_else(|| {
            OG_URL_REGEX
                .find(html)
                .and_then(|tag| CONTENT_ATTR_REGEX.captures(tag.as_str()))
        })
        .map(|caps| caps[1].trim().to_string())?;

    let target = base.join(&candidate).ok()?;
    let target_host = target.host_str()?.to_ascii_lowercase();
    if target_host == current_host || target_host.ends_with(&format!(".{}", current_host)) {
        Some(strip_tracking(target.as_str()))
    } else {
        None
    }
}

fn authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linkedin_recommended_collapses_to_view() {
        assert_eq!(
            canonicalize(
                "https://www.linkedin.com/jobs/collections/recommended/?currentJobId=4012345678&trk=abc"
            ),
            "https://www.linkedin.com/jobs/view/4012345678/"
        );
    }

    #[test]
    fn test_linkedin_view_gains_trailing_slash() {
        assert_eq!(
            canonicalize("https://www.linkedin.com/jobs/view/123?refId=x#top"),
            "https://www.linkedin.com/jobs/view/123/"
        );
        assert_eq!(
            canonicalize("https://www.linkedin.com/jobs/view/123/"),
            "https://www.linkedin.com/jobs/view/123/"
        );
    }

    #[test]
    fn test_generic_drops_query_fragment_and_slash() {
        assert_eq!(
            canonicalize("https://Jobs.Lever.co/acme/abc-123/?utm_source=x#apply"),
            "https://jobs.lever.co/acme/abc-123"
        );
        assert_eq!(canonicalize("https://example.com/"), "https://example.com");
        assert_eq!(
            canonicalize("http://localhost:8080/jobs/1"),
            "http://localhost:8080/jobs/1"
        );
    }

    #[test]
    fn test_canonicalize_is_idempotent() {
        for url in [
            "https://www.linkedin.com/jobs/collections/recommended?currentJobId=9",
            "https://boards.greenhouse.io/acme/jobs/42?gh_src=x",
            "https://example.com/careers/",
        ] {
            let once = canonicalize(url);
            assert_eq!(canonicalize(&once), once);
        }
    }

    #[test]
    fn test_schemeless_input_is_unchanged() {
        assert_eq!(canonicalize("example.com/jobs/1?x=1"), "example.com/jobs/1?x=1");
    }

    #[test]
    fn test_host() {
        assert_eq!(host("https://Boards.Greenhouse.io/acme"), "boards.greenhouse.io");
        assert_eq!(host("not a url"), "");
    }

    #[test]
    fn test_strip_tracking() {
        assert_eq!(
            strip_tracking("https://example.com/a?utm_source=x#frag"),
            "https://example.com/a"
        );
    }

    #[test]
    fn test_meta_canonical_prefers_link_on_same_host() {
        let html = r#"<head>
            <meta property="og:url" content="https://example.com/og">
            <link href="/jobs/7?src=feed" rel="canonical">
        </head>"#;
        assert_eq!(
            meta_canonical(html, "https://example.com/jobs/7?x=1").as_deref(),
            Some("https://example.com/jobs/7")
        );
    }

    #[test]
    fn test_meta_canonical_falls_back_to_og_url() {
        let html = r#"<meta content="https://careers.example.com/j/1" property="og:url">"#;
        assert_eq!(
            meta_canonical(html, "https://example.com/j/1").as_deref(),
            Some("https://careers.example.com/j/1")
        );
    }

    #[test]
    fn test_meta_canonical_rejects_foreign_host() {
        let html = r#"<link rel="canonical" href="https://elsewhere.org/j/1">"#;
        assert_eq!(meta_canonical(html, "https://example.com/j/1"), None);
        assert_eq!(meta_canonical("<html></html>", "https://example.com/"), None);
    }
}
