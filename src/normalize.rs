//! Field normalization and the content hash used as the idempotency key.

use crate::hashing::digest_json;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::LazyLock;

static WHITESPACE_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

static CAREERS_SUFFIX_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*[–-]\s*Careers\b").unwrap());

static AT_CLAUSE_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\s+at\s+.+$").unwrap());

static COMMA_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*,\s*").unwrap());

/// Fields as returned by a field extractor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFields {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub employment_type: Option<String>,
    #[serde(default)]
    pub description_text: String,
    #[serde(default)]
    pub detected_fields: Map<String, Value>,
    /// How each field was found; recorded in the audit trail, never hashed.
    #[serde(default)]
    pub provenance: Map<String, Value>,
}

impl RawFields {
    /// True when no primary field carries any text.
    pub fn is_blank(&self) -> bool {
        [&self.title, &self.company, &self.description_text]
            .iter()
            .all(|s| s.trim().is_empty())
    }
}

/// Canonical form of [`RawFields`]; the content hash is computed over this.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedFields {
    pub title: String,
    pub company: String,
    pub location: String,
    pub employment_type: Option<String>,
    pub description_text: String,
    pub detected_fields: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ContentNormalizer;

impl ContentNormalizer {
    pub fn new() -> Self {
        Self
    }

    pub fn normalize(&self, raw: &RawFields) -> NormalizedFields {
        NormalizedFields {
            title: collapse_whitespace(&raw.title),
            company: tidy_company(&raw.company),
            location: tidy_location(&raw.location),
            employment_type: raw
                .employment_type
                .as_deref()
                .and_then(normalize_employment_type),
            description_text: collapse_whitespace(&raw.description_text),
            detected_fields: strip_volatile(&raw.detected_fields),
        }
    }

    /// SHA-256 over the canonical JSON of `fields`.
    pub fn content_hash(&self, fields: &NormalizedFields) -> String {
        // Strings, options and maps of JSON values always serialize.
        digest_json(fields).unwrap_or_default()
    }
}

pub fn collapse_whitespace(s: &str) -> String {
    WHITESPACE_REGEX.replace_all(s.trim(), " ").into_owned()
}

fn tidy_company(s: &str) -> String {
    let s = collapse_whitespace(s);
    let s = CAREERS_SUFFIX_REGEX.replace_all(&s, "");
    let s = AT_CLAUSE_REGEX.replace(&s, "");
    collapse_whitespace(&s)
}

fn tidy_location(s: &str) -> String {
    let s = collapse_whitespace(s);
    COMMA_REGEX.replace_all(&s, ", ").trim().to_string()
}

/// Map the many spellings of an employment type onto one snake_case label.
pub fn normalize_employment_type(s: &str) -> Option<String> {
    let mut snake = String::with_capacity(s.len());
    for c in s.trim().chars() {
        if c.is_alphanumeric() {
            snake.extend(c.to_lowercase());
        } else if !snake.is_empty() && !snake.ends_with('_') {
            snake.push('_');
        }
    }
    let snake = snake.trim_end_matches('_');
    if snake.is_empty() {
        return None;
    }

    let label = match snake {
        "full_time" | "fulltime" | "full" | "permanent" => "full_time",
        "part_time" | "parttime" | "part" => "part_time",
        "contract" | "contractor" | "contract_to_hire" => "contract",
        "temporary" | "temp" | "seasonal" => "temporary",
        "internship" | "intern" => "internship",
        "volunteer" | "volunteering" => "volunteer",
        other => other,
    };
    Some(label.to_string())
}

fn is_volatile_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    if matches!(
        key.as_str(),
        "timestamp" | "ts" | "date_scraped" | "ref" | "refid" | "nonce" | "request_id" | "trace_id"
    ) {
        return true;
    }
    key.ends_with("_at")
        || ["utm_", "trk", "tracking", "session", "csrf"]
            .iter()
            .any(|prefix| key.starts_with(prefix))
}

fn strip_volatile(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .filter(|(key, _)| !is_volatile_key(key))
        .map(|(key, value)| (key.clone(), normalize_value(value)))
        .collect()
}

fn normalize_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(collapse_whitespace(s)),
        Value::Object(map) => Value::Object(strip_volatile(map)),
        Value::Array(items) => Value::Array(items.iter().map(normalize_value).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn raw(title: &str, company: &str) -> RawFields {
        RawFields {
            title: title.into(),
            company: company.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_whitespace_is_trimmed_and_collapsed() {
        let n = ContentNormalizer::new().normalize(&RawFields {
            title: "  Senior \n\t Engineer ".into(),
            description_text: "Build\n\n things   well".into(),
            ..Default::default()
        });
        assert_eq!(n.title, "Senior Engineer");
        assert_eq!(n.description_text, "Build things well");
    }

    #[test]
    fn test_company_suffixes_are_dropped() {
        let normalizer = ContentNormalizer::new();
        assert_eq!(normalizer.normalize(&raw("", "Acme - Careers")).company, "Acme");
        assert_eq!(normalizer.normalize(&raw("", "Acme – careers")).company, "Acme");
        assert_eq!(
            normalizer.normalize(&raw("", "Engineer at Acme Corp")).company,
            "Engineer"
        );
    }

    #[test]
    fn test_location_comma_spacing() {
        let n = ContentNormalizer::new().normalize(&RawFields {
            location: "Berlin ,Germany,  EU".into(),
            ..Default::default()
        });
        assert_eq!(n.location, "Berlin, Germany, EU");
    }

    #[test]
    fn test_employment_type_spellings_converge() {
        for spelling in ["full time", "Full-Time", "FULL_TIME", "fulltime", " Full  time "] {
            assert_eq!(
                normalize_employment_type(spelling).as_deref(),
                Some("full_time"),
                "{spelling}"
            );
        }
        assert_eq!(normalize_employment_type("Intern").as_deref(), Some("internship"));
        assert_eq!(normalize_employment_type("Per Diem").as_deref(), Some("per_diem"));
        assert_eq!(normalize_employment_type("  - "), None);
    }

    #[test]
    fn test_volatile_detected_fields_are_stripped() {
        let mut detected = Map::new();
        detected.insert("salary".into(), json!("  100k  "));
        detected.insert("scraped_at".into(), json!("2026-01-01"));
        detected.insert("utm_source".into(), json!("mail"));
        detected.insert("trkCampaign".into(), json!("x"));
        detected.insert("sessionId".into(), json!("abc"));
        detected.insert("meta".into(), json!({"team": "core", "request_id": "r-1"}));

        let n = ContentNormalizer::new().normalize(&RawFields {
            detected_fields: detected,
            ..Default::default()
        });
        assert_eq!(
            Value::Object(n.detected_fields),
            json!({"salary": "100k", "meta": {"team": "core"}})
        );
    }

    #[test]
    fn test_volatile_fields_do_not_change_hash() {
        let normalizer = ContentNormalizer::new();
        let mut first = raw("Engineer", "Acme");
        first
            .detected_fields
            .insert("timestamp".into(), json!(1_700_000_000));
        let mut second = raw("Engineer", "Acme");
        second
            .detected_fields
            .insert("timestamp".into(), json!(1_800_000_000));

        assert_eq!(
            normalizer.content_hash(&normalizer.normalize(&first)),
            normalizer.content_hash(&normalizer.normalize(&second))
        );
    }

    #[test]
    fn test_genuine_difference_changes_hash() {
        let normalizer = ContentNormalizer::new();
        let a = normalizer.content_hash(&normalizer.normalize(&raw("Engineer", "Acme")));
        let b = normalizer.content_hash(&normalizer.normalize(&raw("Engineer II", "Acme")));
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_blank_detection() {
        assert!(RawFields::default().is_blank());
        assert!(!raw("Engineer", "").is_blank());
    }

    fn words() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec("[A-Za-z]{1,8}", 1..6)
    }

    proptest! {
        #[test]
        fn prop_content_hash_is_pure(title in words(), company in words(), body in words()) {
            let fields = RawFields {
                title: title.join(" "),
                company: company.join(" "),
                description_text: body.join(" "),
                ..Default::default()
            };
            let normalizer = ContentNormalizer::new();
            let first = normalizer.content_hash(&normalizer.normalize(&fields));
            let second = normalizer.content_hash(&normalizer.normalize(&fields.clone()));
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_whitespace_noise_does_not_change_hash(
            title in words(),
            company in words(),
            location in words(),
        ) {
            let tidy = RawFields {
                title: title.join(" "),
                company: company.join(" "),
                location: location.join(", "),
                ..Default::default()
            };
            let noisy = RawFields {
                title: format!("  {}\n", title.join(" \t ")),
                company: company.join("   "),
                location: location.join(" ,\n"),
                ..Default::default()
            };
            let normalizer = ContentNormalizer::new();
            prop_assert_eq!(
                normalizer.content_hash(&normalizer.normalize(&tidy)),
                normalizer.content_hash(&normalizer.normalize(&noisy))
            );
        }

        #[test]
        fn prop_different_titles_hash_differently(a in words(), b in words()) {
            prop_assume!(a != b);
            let normalizer = ContentNormalizer::new();
            let ha = normalizer.content_hash(&normalizer.normalize(&raw(&a.join(" "), "Acme")));
            let hb = normalizer.content_hash(&normalizer.normalize(&raw(&b.join(" "), "Acme")));
            prop_assert_ne!(ha, hb);
        }
    }
}
