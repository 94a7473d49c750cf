//! SQLite persistence for runs, audit events, artifacts and jobs.
//!
//! Every write is safe to repeat: audit events are keyed by
//! `(run_id, event_hash)`, artifacts by `(run_id, kind)` and jobs by
//! `(url, content_hash)`.

pub mod models;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use crate::artifacts::{Artifact, ArtifactKind};
use crate::audit::{AuditEvent, AuditStatus};
use crate::errors::StoreError;
pub use models::{JobRow, RunRecord, RunStatus, UpsertOutcome};

type Result<T> = std::result::Result<T, StoreError>;

/// Async-safe handle to the store.
///
/// Wraps [`Store`] behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<Store>>,
}

impl DbHandle {
    pub fn new(store: Store) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Store) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = store.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::TaskPanicked(e.to_string()))?
    }

    /// Acquire the store synchronously. For CLI reads and tests only.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, Store>> {
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Other(anyhow::anyhow!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn.busy_timeout(Duration::from_secs(5))?;
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
        self.run_migrations()
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                started_at TEXT NOT NULL,
                finished_at TEXT,
                error_kind TEXT,
                error_message TEXT
            );

            CREATE TABLE IF NOT EXISTS audit_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL REFERENCES runs(run_id),
                step TEXT NOT NULL,
                status TEXT NOT NULL,
                ts_iso TEXT NOT NULL,
                ts_ns INTEGER NOT NULL,
                input_digest TEXT,
                output_digest TEXT,
                artifact_paths TEXT NOT NULL DEFAULT '[]',
                details TEXT NOT NULL DEFAULT '{}',
                prev_event_hash TEXT NOT NULL,
                event_hash TEXT NOT NULL,
                UNIQUE(run_id, event_hash)
            );

            CREATE TABLE IF NOT EXISTS artifacts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL REFERENCES runs(run_id),
                kind TEXT NOT NULL,
                path TEXT NOT NULL,
                sha256 TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(run_id, kind)
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL REFERENCES runs(run_id),
                url TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                extracted_at TEXT NOT NULL,
                record_path TEXT,
                last_run_id TEXT NOT NULL,
                seen_count INTEGER NOT NULL DEFAULT 1,
                UNIQUE(url, content_hash)
            );

            CREATE INDEX IF NOT EXISTS idx_audit_events_run ON audit_events(run_id);
            CREATE INDEX IF NOT EXISTS idx_artifacts_run ON artifacts(run_id);
            CREATE INDEX IF NOT EXISTS idx_jobs_url ON jobs(url);
            ",
        )?;
        Ok(())
    }

    // ── Runs ──────────────────────────────────────────────────────────

    /// Record a new run as `pending`. Repeating the call for the same run is a no-op.
    pub fn insert_run(&self, run_id: &str, url: &str, started_at: &str) -> Result<RunRecord> {
        self.conn.execute(
            "INSERT INTO runs (run_id, url, status, started_at) VALUES (?1, ?2, 'pending', ?3)
             ON CONFLICT(run_id) DO NOTHING",
            params![run_id, url, started_at],
        )?;
        self.get_run(run_id)?.ok_or_else(|| StoreError::RunNotFound {
            run_id: run_id.to_string(),
        })
    }

    /// Move a run to `status`.
    ///
    /// A terminal status is written at most once; setting the same status
    /// again succeeds without changes.
    pub fn update_run_status(
        &mut self,
        run_id: &str,
        status: RunStatus,
        error_kind: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<RunRecord> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.ok_or_else(|| StoreError::RunNotFound {
            run_id: run_id.to_string(),
        })?;
        let current = parse_status(&current)?;

        if current != status {
            if current.is_terminal() {
                return Err(StoreError::RunAlreadyTerminal {
                    run_id: run_id.to_string(),
                    status: current.as_str().to_string(),
                });
            }
            if status.is_terminal() {
                tx.execute(
                    "UPDATE runs SET status = ?1, error_kind = ?2, error_message = ?3,
                     finished_at = ?4 WHERE run_id = ?5",
                    params![
                        status.as_str(),
                        error_kind,
                        error_message,
                        chrono::Utc::now().to_rfc3339(),
                        run_id
                    ],
                )?;
            } else {
                tx.execute(
                    "UPDATE runs SET status = ?1 WHERE run_id = ?2",
                    params![status.as_str(), run_id],
                )?;
            }
        }
        tx.commit()?;

        self.get_run(run_id)?.ok_or_else(|| StoreError::RunNotFound {
            run_id: run_id.to_string(),
        })
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT run_id, url, status, started_at, finished_at, error_kind, error_message
                 FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok(RunRow {
                        run_id: row.get(0)?,
                        url: row.get(1)?,
                        status: row.get(2)?,
                        started_at: row.get(3)?,
                        finished_at: row.get(4)?,
                        error_kind: row.get(5)?,
                        error_message: row.get(6)?,
                    })
                },
            )
            .optional()?;
        row.map(RunRow::into_run_record).transpose()
    }

    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, url, status, started_at, finished_at, error_kind, error_message
             FROM runs ORDER BY started_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(RunRow {
                run_id: row.get(0)?,
                url: row.get(1)?,
                status: row.get(2)?,
                started_at: row.get(3)?,
                finished_at: row.get(4)?,
                error_kind: row.get(5)?,
                error_message: row.get(6)?,
            })
        })?;
        rows.map(|r| r.map_err(StoreError::from).and_then(RunRow::into_run_record))
            .collect()
    }

    // ── Audit events ──────────────────────────────────────────────────

    pub fn insert_audit_event(&mut self, event: &AuditEvent) -> Result<bool> {
        Ok(self.insert_audit_events(std::slice::from_ref(event))? == 1)
    }

    /// Mirror a batch of events in one transaction. Returns how many were new.
    pub fn insert_audit_events(&mut self, events: &[AuditEvent]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO audit_events (run_id, step, status, ts_iso, ts_ns, input_digest,
                    output_digest, artifact_paths, details, prev_event_hash, event_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(run_id, event_hash) DO NOTHING",
            )?;
            for event in events {
                let artifact_paths = serde_json::to_string(&event.artifact_paths)
                    .map_err(|e| StoreError::Other(e.into()))?;
                inserted += stmt.execute(params![
                    event.run_id,
                    event.step,
                    event.status.as_str(),
                    event.ts_iso,
                    event.ts_ns,
                    event.input_digest,
                    event.output_digest,
                    artifact_paths,
                    event.details.to_string(),
                    event.prev_event_hash,
                    event.event_hash,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Events of a run in append order.
    pub fn audit_events_for_run(&self, run_id: &str) -> Result<Vec<AuditEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, step, status, ts_iso, ts_ns, input_digest, output_digest,
                    artifact_paths, details, prev_event_hash, event_hash
             FROM audit_events WHERE run_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(AuditRow {
                run_id: row.get(0)?,
                step: row.get(1)?,
                status: row.get(2)?,
                ts_iso: row.get(3)?,
                ts_ns: row.get(4)?,
                input_digest: row.get(5)?,
                output_digest: row.get(6)?,
                artifact_paths: row.get(7)?,
                details: row.get(8)?,
                prev_event_hash: row.get(9)?,
                event_hash: row.get(10)?,
            })
        })?;
        rows.map(|r| r.map_err(StoreError::from).and_then(AuditRow::into_event))
            .collect()
    }

    // ── Artifacts ─────────────────────────────────────────────────────

    /// Record artifact metadata. Re-recording the same digest is a no-op;
    /// a different digest for the same `(run_id, kind)` is refused.
    pub fn insert_artifact(&self, artifact: &Artifact) -> Result<()> {
        let path = artifact.path.to_string_lossy();
        self.conn.execute(
            "INSERT INTO artifacts (run_id, kind, path, sha256, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(run_id, kind) DO NOTHING",
            params![
                artifact.run_id,
                artifact.kind.as_str(),
                path,
                artifact.sha256,
                artifact.created_at.to_rfc3339()
            ],
        )?;
        let stored: String = self.conn.query_row(
            "SELECT sha256 FROM artifacts WHERE run_id = ?1 AND kind = ?2",
            params![artifact.run_id, artifact.kind.as_str()],
            |row| row.get(0),
        )?;
        if stored != artifact.sha256 {
            return Err(StoreError::Other(anyhow::anyhow!(
                "artifact {} of run {} is already recorded with digest {}",
                artifact.kind.as_str(),
                artifact.run_id,
                stored
            )));
        }
        Ok(())
    }

    pub fn artifacts_for_run(&self, run_id: &str) -> Result<Vec<Artifact>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, kind, path, sha256, created_at FROM artifacts
             WHERE run_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        rows.map(|r| {
            let (run_id, kind, path, sha256, created_at) = r?;
            Ok(Artifact {
                run_id,
                kind: ArtifactKind::from_str(&kind).map_err(|e| StoreError::Other(anyhow::anyhow!(e)))?,
                path: path.into(),
                sha256,
                created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                    .map_err(|e| StoreError::Other(e.into()))?
                    .with_timezone(&chrono::Utc),
            })
        })
        .collect()
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    /// Idempotent upsert keyed by `(url, content_hash)`.
    ///
    /// Runs in an IMMEDIATE transaction, so concurrent writers converge on a
    /// single row. A repeated pair only advances `last_run_id`/`seen_count`.
    pub fn upsert_job(
        &mut self,
        run_id: &str,
        url: &str,
        content_hash: &str,
        record_path: Option<&str>,
    ) -> Result<UpsertOutcome> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, last_run_id FROM jobs WHERE url = ?1 AND content_hash = ?2",
                params![url, content_hash],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let outcome = match existing {
            Some((job_id, last_run_id)) => {
                if last_run_id != run_id {
                    tx.execute(
                        "UPDATE jobs SET last_run_id = ?1, seen_count = seen_count + 1 WHERE id = ?2",
                        params![run_id, job_id],
                    )?;
                }
                UpsertOutcome {
                    job_id,
                    inserted: false,
                }
            }
            None => {
                tx.execute(
                    "INSERT INTO jobs (run_id, url, content_hash, extracted_at, record_path, last_run_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?1)",
                    params![
                        run_id,
                        url,
                        content_hash,
                        chrono::Utc::now().to_rfc3339(),
                        record_path
                    ],
                )?;
                UpsertOutcome {
                    job_id: tx.last_insert_rowid(),
                    inserted: true,
                }
            }
        };
        tx.commit()?;
        Ok(outcome)
    }

    pub fn job_count(&self, url: &str, content_hash: &str) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE url = ?1 AND content_hash = ?2",
            params![url, content_hash],
            |row| row.get(0),
        )?)
    }

    pub fn jobs_for_url(&self, url: &str) -> Result<Vec<JobRow>> {
        self.query_jobs("WHERE url = ?1", url)
    }

    /// Jobs first produced by `run_id`.
    pub fn jobs_for_run(&self, run_id: &str) -> Result<Vec<JobRow>> {
        self.query_jobs("WHERE run_id = ?1", run_id)
    }

    fn query_jobs(&self, filter: &str, arg: &str) -> Result<Vec<JobRow>> {
        let sql = format!(
            "SELECT id, run_id, url, content_hash, extracted_at, record_path, last_run_id, seen_count
             FROM jobs {} ORDER BY id",
            filter
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![arg], |row| {
            Ok(JobRow {
                id: row.get(0)?,
                run_id: row.get(1)?,
                url: row.get(2)?,
                content_hash: row.get(3)?,
                extracted_at: row.get(4)?,
                record_path: row.get(5)?,
                last_run_id: row.get(6)?,
                seen_count: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn parse_status(s: &str) -> Result<RunStatus> {
    RunStatus::from_str(s).map_err(|e| StoreError::Other(anyhow::anyhow!(e)))
}

/// Intermediate row struct for runs.
struct RunRow {
    run_id: String,
    url: String,
    status: String,
    started_at: String,
    finished_at: Option<String>,
    error_kind: Option<String>,
    error_message: Option<String>,
}

impl RunRow {
    fn into_run_record(self) -> Result<RunRecord> {
        Ok(RunRecord {
            status: parse_status(&self.status)?,
            run_id: self.run_id,
            url: self.url,
            started_at: self.started_at,
            finished_at: self.finished_at,
            error_kind: self.error_kind,
            error_message: self.error_message,
        })
    }
}

/// Intermediate row struct for audit_events.
struct AuditRow {
    run_id: String,
    step: String,
    status: String,
    ts_iso: String,
    ts_ns: i64,
    input_digest: Option<String>,
    output_digest: Option<String>,
    artifact_paths: String,
    details: String,
    prev_event_hash: String,
    event_hash: String,
}

impl AuditRow {
    fn into_event(self) -> Result<AuditEvent> {
        let status = AuditStatus::from_str(&self.status)
            .map_err(|e| StoreError::Other(anyhow::anyhow!(e)))?;
        let artifact_paths =
            serde_json::from_str(&self.artifact_paths).map_err(|e| StoreError::Other(e.into()))?;
        let details =
            serde_json::from_str(&self.details).map_err(|e| StoreError::Other(e.into()))?;
        Ok(AuditEvent {
            run_id: self.run_id,
            step: self.step,
            status,
            ts_iso: self.ts_iso,
            ts_ns: self.ts_ns,
            input_digest: self.input_digest,
            output_digest: self.output_digest,
            artifact_paths,
            details,
            prev_event_hash: self.prev_event_hash,
            event_hash: self.event_hash,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditChain, EventDraft};
    use serde_json::json;
    use tempfile::TempDir;

    fn store_with_run(run_id: &str) -> Store {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_run(run_id, "https://example.com/jobs/1", "2026-01-01T00:00:00Z")
            .unwrap();
        store
    }

    #[test]
    fn test_migrations_create_tables() {
        let store = Store::open_in_memory().unwrap();
        let count: i32 = store
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table'
                 AND name IN ('runs', 'audit_events', 'artifacts', 'jobs')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 4);
    }

    #[test]
    fn test_insert_run_is_idempotent() {
        let store = store_with_run("run-1");
        let again = store
            .insert_run("run-1", "https://other.example/", "2030-01-01T00:00:00Z")
            .unwrap();
        assert_eq!(again.url, "https://example.com/jobs/1");
        assert_eq!(again.status, RunStatus::Pending);
    }

    #[test]
    fn test_terminal_status_is_written_once() {
        let mut store = store_with_run("run-1");
        store
            .update_run_status("run-1", RunStatus::Running, None, None)
            .unwrap();
        let failed = store
            .update_run_status(
                "run-1",
                RunStatus::Failed,
                Some("extraction_failure"),
                Some("blank page"),
            )
            .unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert!(failed.finished_at.is_some());
        assert_eq!(failed.error_message.as_deref(), Some("blank page"));

        // Same terminal status again is a harmless retry.
        store
            .update_run_status("run-1", RunStatus::Failed, Some("extraction_failure"), None)
            .unwrap();

        let err = store
            .update_run_status("run-1", RunStatus::Succeeded, None, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::RunAlreadyTerminal { .. }));
    }

    #[test]
    fn test_update_unknown_run() {
        let mut store = Store::open_in_memory().unwrap();
        let err = store
            .update_run_status("missing", RunStatus::Running, None, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::RunNotFound { .. }));
    }

    #[test]
    fn test_upsert_same_pair_twice_yields_one_row() {
        let mut store = store_with_run("run-1");
        store
            .insert_run("run-2", "https://example.com/jobs/1", "2026-01-01T00:00:01Z")
            .unwrap();

        let first = store
            .upsert_job("run-1", "https://example.com/jobs/1", "abc", None)
            .unwrap();
        let second = store
            .upsert_job("run-2", "https://example.com/jobs/1", "abc", None)
            .unwrap();
        let repeat = store
            .upsert_job("run-2", "https://example.com/jobs/1", "abc", None)
            .unwrap();

        assert!(first.inserted);
        assert!(!second.inserted);
        assert_eq!(first.job_id, second.job_id);
        assert_eq!(second, repeat);
        assert_eq!(store.job_count("https://example.com/jobs/1", "abc").unwrap(), 1);

        let jobs = store.jobs_for_url("https://example.com/jobs/1").unwrap();
        assert_eq!(jobs[0].run_id, "run-1");
        assert_eq!(jobs[0].last_run_id, "run-2");
        assert_eq!(jobs[0].seen_count, 2);
    }

    #[test]
    fn test_different_hash_is_a_new_row() {
        let mut store = store_with_run("run-1");
        store
            .upsert_job("run-1", "https://example.com/jobs/1", "abc", None)
            .unwrap();
        let other = store
            .upsert_job("run-1", "https://example.com/jobs/1", "def", None)
            .unwrap();
        assert!(other.inserted);
        assert_eq!(store.jobs_for_url("https://example.com/jobs/1").unwrap().len(), 2);
    }

    #[test]
    fn test_audit_events_round_trip_and_dedupe() {
        let mut store = store_with_run("run-1");
        let mut chain = AuditChain::new("run-1");
        chain.append(EventDraft::new("run", AuditStatus::Started));
        chain.append(
            EventDraft::new("capture", AuditStatus::Succeeded)
                .artifact_paths(vec!["/tmp/run-1/raw.before.html".into()])
                .details(json!({"z": 1, "a": [1, 2]})),
        );

        assert_eq!(store.insert_audit_events(chain.events()).unwrap(), 2);
        assert_eq!(store.insert_audit_events(chain.events()).unwrap(), 0);

        let loaded = store.audit_events_for_run("run-1").unwrap();
        assert_eq!(loaded, chain.events());
        assert!(crate::audit::verify(&loaded).valid);
    }

    #[test]
    fn test_artifact_metadata() {
        let store = store_with_run("run-1");
        let artifact = Artifact {
            run_id: "run-1".into(),
            kind: ArtifactKind::HtmlBefore,
            path: "/tmp/run-1/raw.before.html".into(),
            sha256: "a".repeat(64),
            created_at: chrono::Utc::now(),
        };
        store.insert_artifact(&artifact).unwrap();
        store.insert_artifact(&artifact).unwrap();

        let tampered = Artifact {
            sha256: "b".repeat(64),
            ..artifact.clone()
        };
        assert!(store.insert_artifact(&tampered).is_err());

        let listed = store.artifacts_for_run("run-1").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].sha256, artifact.sha256);
    }

    #[test]
    fn test_concurrent_connections_converge_on_one_job() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobtrail.db");
        let seed = Store::open(&path).unwrap();
        for i in 0..8 {
            seed.insert_run(&format!("run-{i}"), "https://example.com/j", "2026-01-01T00:00:00Z")
                .unwrap();
        }

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let mut store = Store::open(&path).unwrap();
                    store
                        .upsert_job(&format!("run-{i}"), "https://example.com/j", "hash", None)
                        .unwrap()
                })
            })
            .collect();
        let outcomes: Vec<UpsertOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(outcomes.iter().filter(|o| o.inserted).count(), 1);
        assert!(outcomes.windows(2).all(|w| w[0].job_id == w[1].job_id));
        assert_eq!(seed.job_count("https://example.com/j", "hash").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_db_handle_runs_on_blocking_pool() {
        let db = DbHandle::new(Store::open_in_memory().unwrap());
        db.call(|s| s.insert_run("run-1", "https://example.com", "2026-01-01T00:00:00Z"))
            .await
            .unwrap();
        let outcome = db
            .call(|s| s.upsert_job("run-1", "https://example.com", "h", None))
            .await
            .unwrap();
        assert!(outcome.inserted);
        let run = db.lock_sync().unwrap().get_run("run-1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Pending);
    }
}
