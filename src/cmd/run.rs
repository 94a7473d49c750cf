//! Capture commands: `jobtrail run` and `jobtrail batch`.

use anyhow::{Context, Result};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use jobtrail::config::{CliOverrides, Config};
use jobtrail::orchestrator::{Collaborators, RunOptions, RunOrchestrator, RunOutcome};
use jobtrail::session::ResumeToken;
use jobtrail::store::{DbHandle, Store};

use super::{EXIT_FAILED, EXIT_LOGIN_REQUIRED, EXIT_OK, print_json};

fn build_orchestrator(
    mut config: Config,
    fixture: Option<&Path>,
    overrides: &CliOverrides,
) -> Result<RunOrchestrator> {
    config.apply_overrides(overrides);
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    let store = Store::open(&config.db_path())
        .with_context(|| format!("Failed to open database at {}", config.db_path().display()))?;
    let collaborators = Collaborators::defaults(&config, fixture)?;
    Ok(RunOrchestrator::new(
        Arc::new(config),
        collaborators,
        DbHandle::new(store),
    ))
}

/// Cancel `token` on Ctrl-C so the active step records its failure.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; cancelling run");
            token.cancel();
        }
    });
}

fn exit_code(outcome: &RunOutcome) -> i32 {
    match outcome {
        RunOutcome::Completed(_) => EXIT_OK,
        RunOutcome::Failed(_) => EXIT_FAILED,
        RunOutcome::LoginRequired(_) => EXIT_LOGIN_REQUIRED,
    }
}

pub async fn cmd_run(
    config: Config,
    url: Option<String>,
    resume: Option<&str>,
    fixture: Option<PathBuf>,
    overrides: &CliOverrides,
) -> Result<i32> {
    let resume_token = resume
        .map(ResumeToken::decode)
        .transpose()
        .context("Invalid resume token")?;
    let url = match (url, &resume_token) {
        (Some(url), _) => url,
        (None, Some(token)) => token.url.clone(),
        (None, None) => anyhow::bail!("A URL is required unless --resume is given"),
    };

    let orchestrator = build_orchestrator(config, fixture.as_deref(), overrides)?;
    if let Some(token) = &resume_token {
        // A session imported since the suspension must be read from disk.
        orchestrator.sessions().invalidate(&token.host);
        tracing::info!(resumed_from = %token.run_id, host = %token.host, "resuming after login");
    }

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let outcome = orchestrator
        .execute_with(
            &url,
            RunOptions {
                cancel: Some(cancel),
                run_timeout: None,
                resume_token,
            },
        )
        .await?;

    print_json(&outcome)?;
    Ok(exit_code(&outcome))
}

/// Non-blank lines that are not `#` comments.
fn read_url_list(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read URL list {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect())
}

pub async fn cmd_batch(
    config: Config,
    file: &Path,
    fixture: Option<PathBuf>,
    overrides: &CliOverrides,
) -> Result<i32> {
    let urls = read_url_list(file)?;
    if urls.is_empty() {
        anyhow::bail!("No URLs found in {}", file.display());
    }

    let orchestrator = build_orchestrator(config, fixture.as_deref(), overrides)?;
    let concurrency = orchestrator.config().concurrency();
    tracing::info!(urls = urls.len(), concurrency, "starting batch");

    let results = orchestrator.execute_all(urls, concurrency).await;
    let mut failed = 0;
    for (url, result) in &results {
        let line = match result {
            Ok(outcome) => {
                if !outcome.is_success() {
                    failed += 1;
                }
                serde_json::to_string(outcome)?
            }
            Err(e) => {
                failed += 1;
                serde_json::to_string(&json!({
                    "url": url,
                    "status": "failed",
                    "error_kind": e.kind(),
                    "error_message": e.to_string(),
                }))?
            }
        };
        println!("{}", line);
    }

    tracing::info!(total = results.len(), failed, "batch finished");
    Ok(if failed > 0 { EXIT_FAILED } else { EXIT_OK })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_url_list_skips_blanks_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("urls.txt");
        std::fs::write(
            &path,
            "# saved searches\nhttps://jobs.lever.co/acme/1\n\n  https://example.com/job  \n",
        )
        .unwrap();
        assert_eq!(
            read_url_list(&path).unwrap(),
            vec!["https://jobs.lever.co/acme/1", "https://example.com/job"]
        );
    }
}
