//! Hash-chained audit trail.
//!
//! Every orchestration step of a run is recorded as an [`AuditEvent`] whose
//! `event_hash` is `sha256(prev_event_hash ‖ canonical_bytes)`. The first
//! event of a run links to [`GENESIS_HASH`]. [`chain::AuditChain`] holds the
//! in-memory sequence, [`logger::AuditLogger`] flushes it append-only to the
//! run's `audit.jsonl`.

use crate::hashing::canonicalize_value;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::str::FromStr;

pub mod chain;
pub mod logger;

pub use chain::{AuditChain, ChainVerification, verify, verify_strict};
pub use logger::{AuditFileReport, AuditLogger, read_audit_file, verify_audit_file};

/// `prev_event_hash` of the first event in every chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Started,
    Succeeded,
    Failed,
    Retried,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Retried => "retried",
        }
    }
}

impl FromStr for AuditStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(Self::Started),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "retried" => Ok(Self::Retried),
            _ => Err(format!("Invalid audit status: {}", s)),
        }
    }
}

/// One immutable, hash-linked record of an orchestration step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub run_id: String,
    pub step: String,
    pub status: AuditStatus,
    pub ts_iso: String,
    pub ts_ns: i64,
    pub input_digest: Option<String>,
    pub output_digest: Option<String>,
    #[serde(default)]
    pub artifact_paths: Vec<String>,
    #[serde(default)]
    pub details: Value,
    pub prev_event_hash: String,
    pub event_hash: String,
}

impl AuditEvent {
    /// Canonical encoding of every field except `event_hash`.
    ///
    /// A compact JSON array in fixed field order; object keys inside
    /// `details` are sorted recursively.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        Value::Array(vec![
            Value::from(self.run_id.as_str()),
            Value::from(self.step.as_str()),
            Value::from(self.status.as_str()),
            Value::from(self.ts_iso.as_str()),
            Value::from(self.ts_ns),
            self.input_digest.as_deref().map_or(Value::Null, Value::from),
            self.output_digest.as_deref().map_or(Value::Null, Value::from),
            Value::from(self.artifact_paths.clone()),
            canonicalize_value(&self.details),
            Value::from(self.prev_event_hash.as_str()),
        ])
        .to_string()
        .into_bytes()
    }

    /// Recompute the hash this event should carry.
    pub fn compute_hash(&self) -> String {
        chain_hash(&self.prev_event_hash, &self.canonical_bytes())
    }
}

/// `sha256(prev_hash ‖ canonical)` as lowercase hex.
pub fn chain_hash(prev_hash: &str, canonical: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(canonical);
    hex::encode(hasher.finalize())
}

/// Caller-supplied fields of an event that is about to be appended.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub step: String,
    pub status: AuditStatus,
    pub input_digest: Option<String>,
    pub output_digest: Option<String>,
    pub artifact_paths: Vec<String>,
    pub details: Value,
}

impl EventDraft {
    pub fn new(step: impl Into<String>, status: AuditStatus) -> Self {
        Self {
            step: step.into(),
            status,
            input_digest: None,
            output_digest: None,
            artifact_paths: Vec::new(),
            details: Value::Object(Default::default()),
        }
    }

    pub fn input_digest(mut self, digest: Option<String>) -> Self {
        self.input_digest = digest;
        self
    }

    pub fn output_digest(mut self, digest: Option<String>) -> Self {
        self.output_digest = digest;
        self
    }

    pub fn artifact_paths(mut self, paths: Vec<String>) -> Self {
        self.artifact_paths = paths;
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

pub(crate) fn timestamps(now: DateTime<Utc>) -> (String, i64) {
    (
        now.to_rfc3339_opts(SecondsFormat::Micros, true),
        now.timestamp_nanos_opt().unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event() -> AuditEvent {
        let mut event = AuditEvent {
            run_id: "run-1".into(),
            step: "canonicalize".into(),
            status: AuditStatus::Succeeded,
            ts_iso: "2026-01-01T00:00:00.000000Z".into(),
            ts_ns: 1_767_225_600_000_000_000,
            input_digest: None,
            output_digest: Some("abc".into()),
            artifact_paths: vec![],
            details: json!({"to": "https://example.com/jobs/1", "from": "https://example.com/jobs/1?utm=x"}),
            prev_event_hash: GENESIS_HASH.into(),
            event_hash: String::new(),
        };
        event.event_hash = event.compute_hash();
        event
    }

    #[test]
    fn test_genesis_is_64_zeroes() {
        assert_eq!(GENESIS_HASH.len(), 64);
        assert!(GENESIS_HASH.chars().all(|c| c == '0'));
    }

    #[test]
    fn test_canonical_bytes_exclude_event_hash() {
        let mut event = sample_event();
        let before = event.canonical_bytes();
        event.event_hash = "f".repeat(64);
        assert_eq!(before, event.canonical_bytes());
    }

    #[test]
    fn test_canonical_bytes_sort_detail_keys() {
        let event = sample_event();
        let text = String::from_utf8(event.canonical_bytes()).unwrap();
        let from = text.find("\"from\"").unwrap();
        let to = text.find("\"to\"").unwrap();
        assert!(from < to, "details keys must be sorted: {text}");
        assert!(text.starts_with("[\"run-1\",\"canonicalize\",\"succeeded\""));
    }

    #[test]
    fn test_hash_covers_prev_hash() {
        let event = sample_event();
        let mut relinked = event.clone();
        relinked.prev_event_hash = "1".repeat(64);
        assert_ne!(event.compute_hash(), relinked.compute_hash());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            AuditStatus::Started,
            AuditStatus::Succeeded,
            AuditStatus::Failed,
            AuditStatus::Retried,
        ] {
            assert_eq!(status.as_str().parse::<AuditStatus>().unwrap(), status);
        }
        assert!("ok".parse::<AuditStatus>().is_err());
    }
}
