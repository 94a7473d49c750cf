//! Integrity checks: `jobtrail verify-audit` and `jobtrail verify-artifacts`.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;

use jobtrail::artifacts::{ArtifactKind, ArtifactLedger};
use jobtrail::audit::logger::AUDIT_FILE_NAME;
use jobtrail::audit::verify_audit_file;
use jobtrail::config::Config;
use jobtrail::orchestrator::runner::resolve_run_dir;
use jobtrail::store::Store;

use super::{EXIT_FAILED, EXIT_MISSING, EXIT_OK, print_json};

pub fn cmd_verify_audit(config: &Config, run: &str) -> Result<i32> {
    let path = resolve_run_dir(&config.artifacts_dir(), run).join(AUDIT_FILE_NAME);
    if !path.exists() {
        print_json(&json!({
            "run": run,
            "path": path,
            "valid": false,
            "error": "audit trail not found",
        }))?;
        return Ok(EXIT_MISSING);
    }

    let report = verify_audit_file(&path)
        .with_context(|| format!("Failed to read audit trail {}", path.display()))?;
    print_json(&report)?;
    if report.valid {
        Ok(EXIT_OK)
    } else {
        tracing::warn!(
            break_index = ?report.break_index,
            reason = ?report.reason,
            "audit chain is broken"
        );
        Ok(EXIT_FAILED)
    }
}

#[derive(Debug, Serialize)]
struct ArtifactCheck {
    kind: ArtifactKind,
    path: PathBuf,
    sha256: String,
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub fn cmd_verify_artifacts(config: &Config, run: &str) -> Result<i32> {
    let db_path = config.db_path();
    if !db_path.exists() {
        print_json(&json!({"run_id": run, "valid": false, "error": "database not found"}))?;
        return Ok(EXIT_MISSING);
    }
    let store = Store::open(&db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
    let artifacts = store.artifacts_for_run(run)?;
    if artifacts.is_empty() {
        print_json(&json!({"run_id": run, "valid": false, "error": "no artifacts recorded"}))?;
        return Ok(EXIT_MISSING);
    }

    let ledger = ArtifactLedger::new(config.artifacts_dir());
    let checks: Vec<ArtifactCheck> = artifacts
        .into_iter()
        .map(|artifact| {
            let (valid, error) = match ledger.verify(&artifact) {
                Ok(true) => (true, None),
                Ok(false) => (false, Some("digest mismatch".to_string())),
                Err(e) => (false, Some(e.to_string())),
            };
            ArtifactCheck {
                kind: artifact.kind,
                path: artifact.path,
                sha256: artifact.sha256,
                valid,
                error,
            }
        })
        .collect();

    let valid = checks.iter().all(|c| c.valid);
    print_json(&json!({
        "run_id": run,
        "valid": valid,
        "artifacts": checks,
    }))?;
    Ok(if valid { EXIT_OK } else { EXIT_FAILED })
}
