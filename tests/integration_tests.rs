//! Integration tests for the jobtrail CLI
//!
//! These tests drive the binary against HTML fixtures and check the JSON it
//! prints and its exit codes.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const LEVER_URL: &str = "https://jobs.lever.co/acme/7f3c2a10-5b7e-4c1d-9a8e-1f2b3c4d5e6f";
const LINKEDIN_URL: &str = "https://www.linkedin.com/jobs/view/3812345678/";

/// Helper to create a jobtrail Command bound to a project directory
fn jobtrail(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("jobtrail");
    cmd.arg("--project-dir").arg(dir.path());
    cmd.env_remove("JOBTRAIL_LOG")
        .env_remove("JOBTRAIL_ARTIFACTS_DIR")
        .env_remove("JOBTRAIL_DB_PATH")
        .env_remove("JOBTRAIL_MAX_ATTEMPTS");
    cmd
}

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn stdout_json(output: &std::process::Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).expect("stdout is not JSON")
}

/// Run one capture and return its parsed result.
fn run_fixture(dir: &TempDir, url: &str, page: &str) -> (Option<i32>, serde_json::Value) {
    let output = jobtrail(dir)
        .args(["run", url, "--fixture"])
        .arg(fixture(page))
        .output()
        .unwrap();
    (output.status.code(), stdout_json(&output))
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_jobtrail_help() {
        cargo_bin_cmd!("jobtrail").arg("--help").assert().success();
    }

    #[test]
    fn test_jobtrail_version() {
        cargo_bin_cmd!("jobtrail")
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_run_requires_url_or_resume() {
        let dir = TempDir::new().unwrap();
        jobtrail(&dir)
            .arg("run")
            .assert()
            .failure()
            .stderr(predicate::str::contains("--resume"));
    }
}

// =============================================================================
// Config Tests
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_config_init_creates_toml() {
        let dir = TempDir::new().unwrap();
        jobtrail(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created"));
        assert!(dir.path().join(".jobtrail/jobtrail.toml").exists());

        jobtrail(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_config_show_defaults() {
        let dir = TempDir::new().unwrap();
        jobtrail(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No jobtrail.toml"))
            .stdout(predicate::str::contains("[retries]"))
            .stdout(predicate::str::contains("max_attempts = 3"));
    }

    #[test]
    fn test_config_validate_default_is_clean() {
        let dir = TempDir::new().unwrap();
        jobtrail(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".jobtrail")).unwrap();
        fs::write(
            dir.path().join(".jobtrail/jobtrail.toml"),
            "[retries]\nmax_attempts = 0\nbackoff_initial_ms = 5000\nbackoff_max_ms = 100\n",
        )
        .unwrap();

        jobtrail(&dir)
            .args(["config", "validate"])
            .assert()
            .code(1)
            .stdout(predicate::str::contains("max_attempts = 0"))
            .stdout(predicate::str::contains("backoff_initial_ms"));
    }
}

// =============================================================================
// Run Tests
// =============================================================================

mod run {
    use super::*;

    #[test]
    fn test_run_succeeds_and_prints_summary() {
        let dir = TempDir::new().unwrap();
        let (code, result) = run_fixture(&dir, LEVER_URL, "lever.html");

        assert_eq!(code, Some(0));
        assert_eq!(result["status"], "succeeded");
        assert_eq!(result["canonical_url"], LEVER_URL);
        assert_eq!(result["final_url"], LEVER_URL);
        assert_eq!(result["platform"], "lever");
        assert_eq!(result["content_hash"].as_str().unwrap().len(), 64);

        let artifacts_dir = PathBuf::from(result["artifacts_dir"].as_str().unwrap());
        assert!(artifacts_dir.join("audit.jsonl").exists());
        assert!(PathBuf::from(result["job_record_path"].as_str().unwrap()).exists());
        assert!(dir.path().join(".jobtrail/jobtrail.db").exists());
    }

    #[test]
    fn test_run_without_screenshot_or_html() {
        let dir = TempDir::new().unwrap();
        let output = jobtrail(&dir)
            .args(["run", LEVER_URL, "--no-screenshot", "--no-html", "--fixture"])
            .arg(fixture("lever.html"))
            .output()
            .unwrap();
        assert!(output.status.success());

        let result = stdout_json(&output);
        let artifacts_dir = PathBuf::from(result["artifacts_dir"].as_str().unwrap());
        let mut names: Vec<String> = fs::read_dir(&artifacts_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["audit.jsonl", "job_record.json"]);
    }

    #[test]
    fn test_run_on_blank_page_exits_nonzero() {
        let dir = TempDir::new().unwrap();
        let (code, result) = run_fixture(&dir, "https://careers.example.com/jobs/1", "empty.html");

        assert_eq!(code, Some(1));
        assert_eq!(result["status"], "failed");
        assert_eq!(result["error_kind"], "extraction_failure");
        assert_eq!(result["failed_step"], "extract");
    }

    #[test]
    fn test_run_same_posting_twice_reuses_job() {
        let dir = TempDir::new().unwrap();
        let (_, first) = run_fixture(&dir, LEVER_URL, "lever.html");
        let (_, second) = run_fixture(&dir, LEVER_URL, "lever.html");

        assert_ne!(first["run_id"], second["run_id"]);
        assert_eq!(first["content_hash"], second["content_hash"]);
        assert_eq!(first["job_id"], second["job_id"]);
        assert_eq!(first["job_inserted"], true);
        assert_eq!(second["job_inserted"], false);
    }
}

// =============================================================================
// Login Tests
// =============================================================================

mod login {
    use super::*;

    #[test]
    fn test_login_wall_exits_with_resume_token() {
        let dir = TempDir::new().unwrap();
        let (code, result) = run_fixture(&dir, LINKEDIN_URL, "linkedin_login.html");

        assert_eq!(code, Some(3));
        assert_eq!(result["error_kind"], "login_required");
        assert_eq!(result["host"], "www.linkedin.com");
        assert!(!result["resume_token"].as_str().unwrap().is_empty());
    }

    #[test]
    fn test_import_session_then_resume() {
        let dir = TempDir::new().unwrap();
        let (_, suspended) = run_fixture(&dir, LINKEDIN_URL, "linkedin_login.html");
        let token = suspended["resume_token"].as_str().unwrap().to_string();

        let cookies = dir.path().join("cookies.json");
        fs::write(&cookies, r#"[{"name": "li_at", "value": "AQEDAR"}]"#).unwrap();
        jobtrail(&dir)
            .args(["auth", "import", "--host", "www.linkedin.com", "--file"])
            .arg(&cookies)
            .assert()
            .success()
            .stdout(predicate::str::contains("\"cookies\": 1"));

        jobtrail(&dir)
            .args(["auth", "status", "--host", "www.linkedin.com"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"present\": true"));

        let output = jobtrail(&dir)
            .args(["run", "--resume", &token, "--fixture"])
            .arg(fixture("linkedin.html"))
            .output()
            .unwrap();
        assert_eq!(output.status.code(), Some(0));
        let result = stdout_json(&output);
        assert_eq!(result["canonical_url"], LINKEDIN_URL);
        assert_eq!(result["platform"], "linkedin");
    }

    #[test]
    fn test_auth_status_without_session() {
        let dir = TempDir::new().unwrap();
        jobtrail(&dir)
            .args(["auth", "status", "--host", "www.linkedin.com"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"present\": false"));
    }

    #[test]
    fn test_bad_resume_token_is_rejected() {
        let dir = TempDir::new().unwrap();
        jobtrail(&dir)
            .args(["run", "--resume", "not-a-token"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid resume token"));
    }
}

// =============================================================================
// Verification Tests
// =============================================================================

mod verify {
    use super::*;

    #[test]
    fn test_verify_audit_of_fresh_run() {
        let dir = TempDir::new().unwrap();
        let (_, result) = run_fixture(&dir, LEVER_URL, "lever.html");
        let run_id = result["run_id"].as_str().unwrap();

        let output = jobtrail(&dir)
            .args(["verify-audit", "--run", run_id])
            .output()
            .unwrap();
        assert_eq!(output.status.code(), Some(0));
        let report = stdout_json(&output);
        assert_eq!(report["valid"], true);
        assert_eq!(report["run_id"], run_id);
        assert_eq!(report["events"], 18);
        assert!(report["break_index"].is_null());
    }

    #[test]
    fn test_verify_audit_accepts_run_directory() {
        let dir = TempDir::new().unwrap();
        let (_, result) = run_fixture(&dir, LEVER_URL, "lever.html");
        let artifacts_dir = result["artifacts_dir"].as_str().unwrap();

        jobtrail(&dir)
            .args(["verify-audit", "--run", artifacts_dir])
            .assert()
            .success();
    }

    #[test]
    fn test_verify_audit_detects_edit() {
        let dir = TempDir::new().unwrap();
        let (_, result) = run_fixture(&dir, LEVER_URL, "lever.html");
        let run_id = result["run_id"].as_str().unwrap();
        let path = PathBuf::from(result["artifacts_dir"].as_str().unwrap()).join("audit.jsonl");

        let content = fs::read_to_string(&path).unwrap();
        let edited = content.replacen(LEVER_URL, "https://jobs.lever.co/evil/1", 1);
        assert_ne!(content, edited);
        fs::write(&path, edited).unwrap();

        let output = jobtrail(&dir)
            .args(["verify-audit", "--run", run_id])
            .output()
            .unwrap();
        assert_eq!(output.status.code(), Some(1));
        let report = stdout_json(&output);
        assert_eq!(report["valid"], false);
        assert!(report["break_index"].is_u64());
    }

    #[test]
    fn test_verify_audit_missing_run() {
        let dir = TempDir::new().unwrap();
        jobtrail(&dir)
            .args(["verify-audit", "--run", "no-such-run"])
            .assert()
            .code(2)
            .stdout(predicate::str::contains("audit trail not found"));
    }

    #[test]
    fn test_verify_artifacts_detects_tampering() {
        let dir = TempDir::new().unwrap();
        let (_, result) = run_fixture(&dir, LEVER_URL, "lever.html");
        let run_id = result["run_id"].as_str().unwrap();

        jobtrail(&dir)
            .args(["verify-artifacts", "--run", run_id])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"valid\": true"));

        fs::write(result["job_record_path"].as_str().unwrap(), "{}").unwrap();
        let output = jobtrail(&dir)
            .args(["verify-artifacts", "--run", run_id])
            .output()
            .unwrap();
        assert_eq!(output.status.code(), Some(1));
        let report = stdout_json(&output);
        let bad: Vec<&serde_json::Value> = report["artifacts"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|a| a["valid"] == false)
            .collect();
        assert_eq!(bad.len(), 1);
        assert_eq!(bad[0]["kind"], "job_record");
    }
}

// =============================================================================
// Batch Tests
// =============================================================================

mod batch {
    use super::*;

    #[test]
    fn test_batch_prints_one_line_per_url() {
        let dir = TempDir::new().unwrap();
        let list = dir.path().join("urls.txt");
        fs::write(
            &list,
            format!("# lever\n{}\n{}?utm_source=feed\n", LEVER_URL, LEVER_URL),
        )
        .unwrap();

        let output = jobtrail(&dir)
            .args(["batch", "--concurrency", "2", "--fixture"])
            .arg(fixture("lever.html"))
            .arg(&list)
            .output()
            .unwrap();
        assert!(output.status.success());

        let stdout = String::from_utf8(output.stdout).unwrap();
        let lines: Vec<serde_json::Value> = stdout
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| l["status"] == "succeeded"));
        assert_eq!(lines[0]["content_hash"], lines[1]["content_hash"]);
    }

    #[test]
    fn test_batch_with_a_failure_exits_nonzero() {
        let dir = TempDir::new().unwrap();
        let list = dir.path().join("urls.txt");
        fs::write(&list, format!("{}\nftp://example.com/job\n", LEVER_URL)).unwrap();

        jobtrail(&dir)
            .args(["batch", "--fixture"])
            .arg(fixture("lever.html"))
            .arg(&list)
            .assert()
            .code(1);
    }
}
