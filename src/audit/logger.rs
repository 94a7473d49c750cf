use super::chain::{AuditChain, verify};
use super::{AuditEvent, EventDraft};
use crate::errors::AuditError;
use chrono::Utc;
use fs2::FileExt;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// File name of the line-delimited audit trail inside a run directory.
pub const AUDIT_FILE_NAME: &str = "audit.jsonl";

/// Single writer of one run's audit trail.
///
/// Holds the in-memory chain and an exclusive lock on `<run_dir>/audit.jsonl`.
/// Every recorded event is written as one JSON line before it joins the
/// chain; events not yet mirrored to the store are queued until
/// [`take_unflushed`](Self::take_unflushed) drains them.
pub struct AuditLogger {
    chain: AuditChain,
    audit_path: PathBuf,
    file: File,
    unflushed: Vec<AuditEvent>,
}

impl AuditLogger {
    /// Open (or resume) the audit trail of `run_id` inside `run_dir`.
    pub fn open(run_dir: &Path, run_id: &str) -> Result<Self, AuditError> {
        fs::create_dir_all(run_dir).map_err(|source| AuditError::Io {
            path: run_dir.to_path_buf(),
            source,
        })?;
        let audit_path = run_dir.join(AUDIT_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&audit_path)
            .map_err(|source| AuditError::Io {
                path: audit_path.clone(),
                source,
            })?;
        file.try_lock_exclusive()
            .map_err(|_| AuditError::WriterBusy {
                path: audit_path.clone(),
            })?;

        let existing = read_audit_file(&audit_path)?;
        let chain = if existing.is_empty() {
            AuditChain::new(run_id)
        } else {
            AuditChain::resume(run_id, existing)?
        };

        Ok(Self {
            chain,
            audit_path,
            file,
            unflushed: Vec::new(),
        })
    }

    /// A fresh chain written to an already opened `file`.
    #[cfg(test)]
    pub(crate) fn from_parts(run_id: &str, audit_path: PathBuf, file: File) -> Self {
        Self {
            chain: AuditChain::new(run_id),
            audit_path,
            file,
            unflushed: Vec::new(),
        }
    }

    /// Append an event to the chain and the trail file.
    pub fn record(&mut self, draft: EventDraft) -> Result<AuditEvent, AuditError> {
        let event = self.chain.prepare(draft, Utc::now());
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .and_then(|()| self.file.flush())
            .map_err(|source| AuditError::Io {
                path: self.audit_path.clone(),
                source,
            })?;
        self.chain.commit(event.clone())?;
        self.unflushed.push(event.clone());
        Ok(event)
    }

    /// Drain events that have not been mirrored to the store yet.
    pub fn take_unflushed(&mut self) -> Vec<AuditEvent> {
        std::mem::take(&mut self.unflushed)
    }

    /// Put back events whose mirroring failed, ahead of newer ones.
    pub fn requeue(&mut self, mut events: Vec<AuditEvent>) {
        events.append(&mut self.unflushed);
        self.unflushed = events;
    }

    pub fn chain(&self) -> &AuditChain {
        &self.chain
    }

    pub fn audit_path(&self) -> &Path {
        &self.audit_path
    }
}

/// Parse every event of an audit trail file.
///
/// A line that does not parse is reported as a chain break at its index.
pub fn read_audit_file(path: &Path) -> Result<Vec<AuditEvent>, AuditError> {
    let content = fs::read_to_string(path).map_err(|source| AuditError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(index, line)| {
            serde_json::from_str::<AuditEvent>(line).map_err(|e| AuditError::ChainIntegrity {
                index,
                reason: format!("unparseable event: {}", e),
            })
        })
        .collect()
}

/// Machine-readable result of verifying an `audit.jsonl` file.
#[derive(Debug, Clone, Serialize)]
pub struct AuditFileReport {
    pub run_id: Option<String>,
    pub events: usize,
    pub valid: bool,
    pub break_index: Option<usize>,
    pub reason: Option<String>,
}

/// Verify the chain stored in an audit trail file.
pub fn verify_audit_file(path: &Path) -> Result<AuditFileReport, AuditError> {
    let events = match read_audit_file(path) {
        Ok(events) => events,
        Err(AuditError::ChainIntegrity { index, reason }) => {
            return Ok(AuditFileReport {
                run_id: None,
                events: index,
                valid: false,
                break_index: Some(index),
                reason: Some(reason),
            });
        }
        Err(other) => return Err(other),
    };

    let report = verify(&events);
    Ok(AuditFileReport {
        run_id: events.first().map(|e| e.run_id.clone()),
        events: report.events,
        valid: report.valid,
        break_index: report.failed_index,
        reason: report.reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditStatus, GENESIS_HASH};
    use serde_json::json;
    use tempfile::TempDir;

    /// Open a logger in a fresh temp run directory; keep the `TempDir` alive
    /// for the duration of the test.
    fn setup_logger() -> (AuditLogger, TempDir) {
        let dir = TempDir::new().expect("failed to create temp dir");
        let logger = AuditLogger::open(&dir.path().join("run-1"), "run-1").unwrap();
        (logger, dir)
    }

    #[test]
    fn test_record_writes_one_line_per_event() {
        let (mut logger, _dir) = setup_logger();
        logger
            .record(EventDraft::new("run", AuditStatus::Started))
            .unwrap();
        logger
            .record(EventDraft::new("canonicalize", AuditStatus::Started))
            .unwrap();

        let content = fs::read_to_string(logger.audit_path()).unwrap();
        assert_eq!(content.lines().count(), 2);
        let first: AuditEvent = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(first.prev_event_hash, GENESIS_HASH);
    }

    #[test]
    fn test_written_trail_verifies() {
        let (mut logger, _dir) = setup_logger();
        for step in ["run", "canonicalize", "session"] {
            logger
                .record(
                    EventDraft::new(step, AuditStatus::Succeeded).details(json!({"step": step})),
                )
                .unwrap();
        }
        let report = verify_audit_file(logger.audit_path()).unwrap();
        assert!(report.valid);
        assert_eq!(report.events, 3);
        assert_eq!(report.run_id.as_deref(), Some("run-1"));
    }

    #[test]
    fn test_tampered_line_is_reported() {
        let (mut logger, _dir) = setup_logger();
        for step in ["run", "canonicalize", "session"] {
            logger
                .record(EventDraft::new(step, AuditStatus::Succeeded))
                .unwrap();
        }
        let path = logger.audit_path().to_path_buf();
        drop(logger);

        let content = fs::read_to_string(&path).unwrap();
        let tampered = content.replacen("\"canonicalize\"", "\"canonicalise\"", 1);
        fs::write(&path, tampered).unwrap();

        let report = verify_audit_file(&path).unwrap();
        assert!(!report.valid);
        assert_eq!(report.break_index, Some(1));
    }

    #[test]
    fn test_garbage_line_is_a_break() {
        let (mut logger, _dir) = setup_logger();
        logger
            .record(EventDraft::new("run", AuditStatus::Started))
            .unwrap();
        let path = logger.audit_path().to_path_buf();
        drop(logger);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{not json}\n").unwrap();

        let report = verify_audit_file(&path).unwrap();
        assert!(!report.valid);
        assert_eq!(report.break_index, Some(1));
    }

    #[test]
    fn test_second_writer_is_refused() {
        let (logger, dir) = setup_logger();
        let second = AuditLogger::open(&dir.path().join("run-1"), "run-1");
        assert!(matches!(second, Err(AuditError::WriterBusy { .. })));
        drop(logger);
    }

    #[test]
    fn test_reopen_resumes_chain() {
        let (mut logger, dir) = setup_logger();
        let first = logger
            .record(EventDraft::new("run", AuditStatus::Started))
            .unwrap();
        drop(logger);

        let mut reopened = AuditLogger::open(&dir.path().join("run-1"), "run-1").unwrap();
        let second = reopened
            .record(EventDraft::new("canonicalize", AuditStatus::Started))
            .unwrap();
        assert_eq!(second.prev_event_hash, first.event_hash);
        assert!(verify_audit_file(reopened.audit_path()).unwrap().valid);
    }

    #[test]
    fn test_unflushed_queue_drains_and_requeues() {
        let (mut logger, _dir) = setup_logger();
        logger
            .record(EventDraft::new("run", AuditStatus::Started))
            .unwrap();
        let batch = logger.take_unflushed();
        assert_eq!(batch.len(), 1);
        assert!(logger.take_unflushed().is_empty());

        logger
            .record(EventDraft::new("canonicalize", AuditStatus::Started))
            .unwrap();
        logger.requeue(batch);
        let again = logger.take_unflushed();
        assert_eq!(again.len(), 2);
        assert_eq!(again[0].step, "run");
        assert_eq!(again[1].step, "canonicalize");
    }
}
