//! `RunOrchestrator`: drives one URL through every [`Step`].
//!
//! Each step runs inside the same envelope: a `started` event, the body under
//! the retry policy (a `retried` event between attempts), then `succeeded`
//! with the digest of the step output or `failed`. The whole run is bracketed
//! by `run/started` and `run/succeeded` / `run/failed`. Nothing already
//! written is rolled back when a step fails.

use super::state::{RunStateMachine, Step};
use super::{
    JobRecord, LoginSuspension, OrchestratorError, RunFailure, RunOutcome, RunState, RunSummary,
};
use crate::adapters::{
    Browser, BrowserError, DetectionError, ExpandOptions, ExpansionReport, FieldExtractor,
    FixtureBrowser, HttpBrowser, PageContent, PageHandle, PlatformDetector, RuleExtractor,
};
use crate::artifacts::{Artifact, ArtifactKind, ArtifactLedger};
use crate::audit::{AuditLogger, AuditStatus, EventDraft};
use crate::config::{Config, DomainAuth};
use crate::dom;
use crate::errors::{ArtifactError, ErrorKind, StepError, StoreError};
use crate::hashing::{digest_json, sha256_file, sha256_hex};
use crate::normalize::{ContentNormalizer, RawFields};
use crate::platform::{HeuristicDetector, Platform};
use crate::retry::RetryPolicy;
use crate::session::{ResumeToken, SessionManager};
use crate::store::{DbHandle, RunStatus, Store, UpsertOutcome};
use crate::urltools;
use chrono::Utc;
use futures::StreamExt;
use serde_json::{Value, json};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

/// External collaborators consumed by the orchestrator.
#[derive(Clone)]
pub struct Collaborators {
    pub browser: Arc<dyn Browser>,
    pub detector: Arc<dyn PlatformDetector>,
    pub extractor: Arc<dyn FieldExtractor>,
}

impl Collaborators {
    /// The adapters shipped with the crate. `fixture` serves a local HTML
    /// file instead of fetching over HTTP.
    pub fn defaults(config: &Config, fixture: Option<&Path>) -> anyhow::Result<Self> {
        let browser: Arc<dyn Browser> = match fixture {
            Some(path) => Arc::new(FixtureBrowser::from_file(path)),
            None => Arc::new(HttpBrowser::new(
                &config.toml.browser.user_agent,
                config.nav_timeout(),
            )?),
        };
        let extractor = if config.toml.extractor.llm_enabled {
            tracing::warn!("no model backend is configured; extracting with rules in degraded mode");
            RuleExtractor::degraded()
        } else {
            RuleExtractor::new()
        };
        Ok(Self {
            browser,
            detector: Arc::new(HeuristicDetector::new()),
            extractor: Arc::new(extractor),
        })
    }
}

/// Per-invocation controls.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Aborts the run between or during steps.
    pub cancel: Option<CancellationToken>,
    /// Ceiling for the whole run; overrides `timeouts.run_ms`.
    pub run_timeout: Option<Duration>,
    /// Token from an earlier login suspension.
    pub resume_token: Option<ResumeToken>,
}

/// What a step body hands back to the envelope.
struct StepOutput<T> {
    value: T,
    output_digest: Option<String>,
    details: Value,
    artifact_paths: Vec<String>,
}

impl<T> StepOutput<T> {
    fn new(value: T, output_digest: Option<String>) -> Self {
        Self {
            value,
            output_digest,
            details: json!({}),
            artifact_paths: Vec::new(),
        }
    }

    fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    fn artifacts(mut self, artifacts: &[Artifact]) -> Self {
        self.artifact_paths = artifacts
            .iter()
            .map(|a| a.path.to_string_lossy().into_owned())
            .collect();
        self
    }
}

#[derive(Debug)]
struct StepFailure {
    step: Option<Step>,
    error: StepError,
    attempts: u32,
}

impl StepFailure {
    fn audit(step: Step, err: crate::errors::AuditError) -> Self {
        Self {
            step: Some(step),
            error: StepError::Fatal(format!("audit trail: {}", err)),
            attempts: 0,
        }
    }
}

/// Mutable state of one run while it executes.
struct RunContext {
    run_id: String,
    url: String,
    logger: AuditLogger,
    machine: RunStateMachine,
    cancel: CancellationToken,
    timed_out: Arc<AtomicBool>,
    canonical_url: Option<String>,
    final_url: Option<String>,
    host: String,
    page: Option<PageHandle>,
}

struct SessionOutput {
    page: PageHandle,
    final_url: String,
    html: String,
}

struct Completed {
    canonical_url: String,
    final_url: String,
    platform: Platform,
    content_hash: String,
    record: Artifact,
    upsert: UpsertOutcome,
}

pub struct RunOrchestrator {
    config: Arc<Config>,
    collaborators: Collaborators,
    sessions: Arc<SessionManager>,
    ledger: ArtifactLedger,
    db: DbHandle,
    normalizer: ContentNormalizer,
    policy: RetryPolicy,
}

impl RunOrchestrator {
    pub fn new(config: Arc<Config>, collaborators: Collaborators, db: DbHandle) -> Self {
        let sessions = Arc::new(SessionManager::new(
            config.sessions_dir(),
            config.session_ttl(),
        ));
        Self {
            ledger: ArtifactLedger::new(config.artifacts_dir()),
            policy: config.retry_policy(),
            normalizer: ContentNormalizer::new(),
            sessions,
            collaborators,
            db,
            config,
        }
    }

    /// Share a session manager between orchestrators.
    pub fn with_sessions(mut self, sessions: Arc<SessionManager>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ledger(&self) -> &ArtifactLedger {
        &self.ledger
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub async fn execute(&self, url: &str) -> Result<RunOutcome, OrchestratorError> {
        self.execute_with(url, RunOptions::default()).await
    }

    /// Run several URLs with at most `concurrency` runs in flight.
    /// Results come back in input order.
    pub async fn execute_all(
        &self,
        urls: Vec<String>,
        concurrency: usize,
    ) -> Vec<(String, Result<RunOutcome, OrchestratorError>)> {
        let mut results: Vec<_> = futures::stream::iter(urls.into_iter().enumerate())
            .map(|(index, url)| async move {
                let outcome = self.execute(&url).await;
                (index, url, outcome)
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;
        results.sort_by_key(|(index, _, _)| *index);
        results
            .into_iter()
            .map(|(_, url, outcome)| (url, outcome))
            .collect()
    }

    pub async fn execute_with(
        &self,
        url: &str,
        options: RunOptions,
    ) -> Result<RunOutcome, OrchestratorError> {
        let run_id = Uuid::new_v4().to_string();
        let logger = AuditLogger::open(&self.ledger.run_dir(&run_id), &run_id)?;
        self.execute_run(run_id, url, logger, options).await
    }

    async fn execute_run(
        &self,
        run_id: String,
        url: &str,
        logger: AuditLogger,
        options: RunOptions,
    ) -> Result<RunOutcome, OrchestratorError> {
        let (id, target, started_at) = (run_id.clone(), url.to_string(), Utc::now().to_rfc3339());
        self.store_call(move |db| {
            db.insert_run(&id, &target, &started_at)?;
            db.update_run_status(&id, RunStatus::Running, None, None)
        })
        .await?;

        let cancel = options
            .cancel
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        let timed_out = Arc::new(AtomicBool::new(false));
        let timer = options
            .run_timeout
            .or_else(|| self.config.run_timeout())
            .map(|limit| {
                let token = cancel.clone();
                let flag = timed_out.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(limit).await;
                    flag.store(true, Ordering::SeqCst);
                    token.cancel();
                })
            });

        let mut run = RunContext {
            run_id: run_id.clone(),
            url: url.to_string(),
            logger,
            machine: RunStateMachine::new(),
            cancel,
            timed_out,
            canonical_url: None,
            final_url: None,
            host: String::new(),
            page: None,
        };

        let span = tracing::info_span!("run", run_id = %run_id);
        let result = async {
            tracing::info!(url, "run started");
            run.logger.record(
                EventDraft::new("run", AuditStatus::Started)
                    .input_digest(Some(sha256_hex(url.as_bytes())))
                    .details(json!({
                        "url": url,
                        "cfg_hash": self.config.cfg_hash(),
                        "resumed_from": options.resume_token.as_ref().map(|t| t.run_id.clone()),
                    })),
            )?;
            Ok::<_, OrchestratorError>(self.run_steps(&mut run).await)
        }
        .instrument(span.clone())
        .await;

        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(page) = run.page.take() {
            self.collaborators.browser.close(&page).await;
        }

        let outcome = match result {
            Ok(Ok(completed)) => self.finish_success(&mut run, completed).instrument(span).await,
            Ok(Err(failure)) => self.finish_failure(&mut run, failure).instrument(span).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &outcome {
            self.abandon_run(&run_id, e).await;
        }
        outcome
    }

    /// Close the run row as failed when the run could not reach a terminal
    /// status on its own, e.g. because its audit trail became unwritable.
    async fn abandon_run(&self, run_id: &str, error: &OrchestratorError) {
        tracing::error!(run_id, error = %error, "run aborted before reaching a terminal status");
        let (id, kind, msg) = (run_id.to_string(), error.kind().as_str().to_string(), error.to_string());
        let closed = self
            .store_call(move |db| {
                db.update_run_status(&id, RunStatus::Failed, Some(&kind), Some(&msg))
            })
            .await;
        match closed {
            Ok(_) | Err(StoreError::RunAlreadyTerminal { .. }) => {}
            Err(e) => tracing::error!(run_id, error = %e, "could not mark the run failed"),
        }
    }

    async fn run_steps(&self, run: &mut RunContext) -> Result<Completed, StepFailure> {
        let browser = self.collaborators.browser.clone();

        // ── canonicalize ──
        let input = run.url.clone();
        let canonical = self
            .run_step(run, Step::Canonicalize, Some(sha256_hex(input.as_bytes())), move |_| {
                let input = input.clone();
                async move {
                    let parsed = reqwest::Url::parse(&input)
                        .map_err(|e| StepError::Fatal(format!("invalid URL {}: {}", input, e)))?;
                    if !matches!(parsed.scheme(), "http" | "https") {
                        return Err(StepError::Fatal(format!(
                            "unsupported URL scheme: {}",
                            parsed.scheme()
                        )));
                    }
                    let canonical = urltools::canonicalize(&input);
                    let digest = sha256_hex(canonical.as_bytes());
                    Ok::<_, StepError>(StepOutput::new(canonical.clone(), Some(digest))
                        .details(json!({"from": input, "to": canonical})))
                }
            })
            .await?;
        run.host = urltools::host(&canonical);
        run.canonical_url = Some(canonical.clone());

        // ── session ──
        let sessions = self.sessions.clone();
        let domain = self.config.domain_auth(&run.host).cloned();
        let (target, host) = (canonical.clone(), run.host.clone());
        let session = self
            .run_step(run, Step::Session, Some(sha256_hex(canonical.as_bytes())), move |_| {
                let (browser, sessions, domain) = (browser.clone(), sessions.clone(), domain.clone());
                let (target, host) = (target.clone(), host.clone());
                async move {
                    let state = sessions.acquire(&host).await;
                    let nav = browser.navigate(&target, state.as_deref()).await?;
                    let bytes = browser.snapshot(&nav.page).await?;
                    let html = String::from_utf8_lossy(&bytes).into_owned();

                    if login_gate(domain.as_ref(), &html, state.is_some()) {
                        if state.is_some() {
                            tracing::info!(host = %host, "stored session no longer passes the login gate");
                            sessions.invalidate(&host);
                        }
                        browser.close(&nav.page).await;
                        return Err(StepError::LoginRequired { host });
                    }

                    let (final_url, source) = match urltools::meta_canonical(&html, &nav.final_url) {
                        Some(meta) => (urltools::canonicalize(&meta), "meta"),
                        None => (urltools::canonicalize(&nav.final_url), "navigation"),
                    };
                    let digest = sha256_hex(&bytes);
                    let details = json!({
                        "host": host,
                        "session_loaded": state.is_some(),
                        "final_url": final_url,
                        "final_url_source": source,
                        "bytes": bytes.len(),
                    });
                    Ok::<_, StepError>(StepOutput::new(
                        SessionOutput {
                            page: nav.page,
                            final_url,
                            html,
                        },
                        Some(digest),
                    )
                    .details(details))
                }
            })
            .await?;
        run.page = Some(session.page.clone());
        let final_url = session.final_url.clone();
        run.final_url = Some(final_url.clone());
        let html_before = Arc::new(session.html);

        // ── detect_platform ──
        let detector = self.collaborators.detector.clone();
        let (probe_url, probe_html) = (final_url.clone(), html_before.clone());
        let platform = self
            .run_step(run, Step::DetectPlatform, Some(sha256_hex(final_url.as_bytes())), move |_| {
                let (detector, url, html) = (detector.clone(), probe_url.clone(), probe_html.clone());
                async move {
                    match detector.probe(&url, &html).await {
                        Ok(detection) => {
                            let digest = digest_json(&detection).ok();
                            let details = json!({
                                "platform": detection.platform,
                                "confidence": detection.confidence,
                                "matched_selectors": detection.matched_selectors,
                            });
                            Ok::<_, StepError>(StepOutput::new(detection.platform, digest).details(details))
                        }
                        Err(DetectionError::Ambiguous { candidates }) => {
                            tracing::info!(?candidates, "platform is ambiguous; using the generic path");
                            let details = json!({
                                "platform": Platform::Generic,
                                "error_kind": ErrorKind::PlatformDetectionAmbiguous,
                                "candidates": candidates,
                                "degraded": true,
                            });
                            Ok::<_, StepError>(StepOutput::new(
                                Platform::Generic,
                                Some(sha256_hex(Platform::Generic.as_str().as_bytes())),
                            )
                            .details(details))
                        }
                        Err(e @ DetectionError::Probe(_)) => Err(StepError::Transient(e.to_string())),
                    }
                }
            })
            .await?;

        // ── expand ──
        let options = self.config.expand_options(platform);
        let wait_limit = self.config.nav_timeout();
        let page = session.page.clone();
        let browser = self.collaborators.browser.clone();
        let expanded = self
            .run_step(run, Step::Expand, Some(sha256_hex(html_before.as_bytes())), move |_| {
                let (browser, page, options) = (browser.clone(), page.clone(), options.clone());
                async move {
                    expand_description(browser.as_ref(), &page, &options, wait_limit).await
                }
            })
            .await?;
        let html_after = Arc::new(expanded);

        // ── capture ──
        let keep_html = self.config.toml.artifacts.keep_raw_before_after;
        let want_screenshot = self.config.toml.artifacts.screenshot;
        let can_screenshot = self.collaborators.browser.capabilities().screenshot;
        let (ledger, db) = (self.ledger.clone(), self.db.clone());
        let run_id = run.run_id.clone();
        let (before, after, page) = (html_before.clone(), html_after.clone(), session.page.clone());
        let browser = self.collaborators.browser.clone();
        self.run_step(run, Step::Capture, None, move |_| {
            let (browser, ledger, db, page) = (browser.clone(), ledger.clone(), db.clone(), page.clone());
            let (run_id, before, after) = (run_id.clone(), before.clone(), after.clone());
            async move {
                let mut artifacts = Vec::new();
                if keep_html {
                    artifacts.push(register_once(&ledger, &run_id, ArtifactKind::HtmlBefore, before.as_bytes())?);
                    artifacts.push(register_once(&ledger, &run_id, ArtifactKind::HtmlAfter, after.as_bytes())?);
                }

                let screenshot = match (want_screenshot, can_screenshot) {
                    (false, _) => json!({"skipped": "disabled"}),
                    (true, false) => json!({"skipped": "unsupported by browser"}),
                    (true, true) => match browser.capture(&page).await {
                        Ok(png) => {
                            let artifact =
                                register_once(&ledger, &run_id, ArtifactKind::Screenshot, &png)?;
                            let sha = artifact.sha256.clone();
                            artifacts.push(artifact);
                            json!({"sha256": sha})
                        }
                        Err(BrowserError::Unsupported(what)) => {
                            json!({"skipped": format!("browser does not support {}", what)})
                        }
                        Err(e) => return Err(e.into()),
                    },
                };

                for artifact in &artifacts {
                    let artifact = artifact.clone();
                    db.call(move |s| s.insert_artifact(&artifact)).await?;
                }

                let listing: Vec<(&str, &str)> = artifacts
                    .iter()
                    .map(|a| (a.kind.as_str(), a.sha256.as_str()))
                    .collect();
                let digest = digest_json(&listing).ok();
                let mut details = json!({
                    "artifacts": listing,
                    "screenshot": screenshot,
                    "raw_html": keep_html,
                });
                if screenshot.get("skipped").is_some() {
                    details["screenshot_skipped"] = json!(true);
                }
                Ok::<_, StepError>(StepOutput::new((), digest)
                    .details(details)
                    .artifacts(&artifacts))
            }
        })
        .await?;

        // ── extract ──
        let extractor = self.collaborators.extractor.clone();
        let (page_url, page_html) = (final_url.clone(), html_after.clone());
        let raw = self
            .run_step(run, Step::Extract, Some(sha256_hex(html_after.as_bytes())), move |_| {
                let (extractor, url, html) = (extractor.clone(), page_url.clone(), page_html.clone());
                async move {
                    let mode = extractor.mode();
                    let raw = extractor
                        .extract(PageContent { url: &url, html: &html }, platform)
                        .await?;
                    if raw.is_blank() {
                        return Err(StepError::Extraction(
                            "extractor returned no title, company or description".into(),
                        ));
                    }
                    let digest = digest_json(&raw).ok();
                    let details = json!({
                        "mode": mode,
                        "provenance": raw.provenance,
                    });
                    Ok::<_, StepError>(StepOutput::new(raw, digest).details(details))
                }
            })
            .await?;

        // ── normalize ──
        let normalizer = self.normalizer;
        let raw_digest = digest_json(&raw).ok();
        let raw = Arc::new(raw);
        let raw_fields = raw.clone();
        let (normalized, content_hash) = self
            .run_step(run, Step::Normalize, raw_digest, move |_| {
                let raw: Arc<RawFields> = raw_fields.clone();
                async move {
                    let normalized = normalizer.normalize(&raw);
                    let hash = normalizer.content_hash(&normalized);
                    let details = json!({"content_hash": hash});
                    Ok::<_, StepError>(StepOutput::new((normalized, hash.clone()), Some(hash)).details(details))
                }
            })
            .await?;

        // ── persist ──
        let record = JobRecord {
            run_id: run.run_id.clone(),
            url: run.url.clone(),
            canonical_url: canonical.clone(),
            final_url: final_url.clone(),
            platform,
            title: normalized.title,
            company: normalized.company,
            location: normalized.location,
            employment_type: normalized.employment_type,
            description_text: normalized.description_text,
            detected_fields: normalized.detected_fields,
            content_hash: content_hash.clone(),
            extracted_at: Utc::now().to_rfc3339(),
        };
        let record_bytes = Arc::new(
            serde_json::to_vec_pretty(&record)
                .map_err(|e| StepFailure {
                    step: Some(Step::Persist),
                    error: StepError::Fatal(format!("encoding job record: {}", e)),
                    attempts: 0,
                })?,
        );
        let (ledger, db) = (self.ledger.clone(), self.db.clone());
        let (run_id, job_url, hash) = (run.run_id.clone(), canonical.clone(), content_hash.clone());
        let (artifact, upsert) = self
            .run_step(run, Step::Persist, Some(content_hash.clone()), move |_| {
                let (ledger, db, bytes) = (ledger.clone(), db.clone(), record_bytes.clone());
                let (run_id, job_url, hash) = (run_id.clone(), job_url.clone(), hash.clone());
                async move {
                    let artifact = register_once(&ledger, &run_id, ArtifactKind::JobRecord, &bytes)?;
                    ledger.read_verified(&artifact)?;
                    let stored = artifact.clone();
                    db.call(move |s| s.insert_artifact(&stored)).await?;

                    let record_path = artifact.path.to_string_lossy().into_owned();
                    let upsert = db
                        .call(move |s| s.upsert_job(&run_id, &job_url, &hash, Some(&record_path)))
                        .await?;
                    let details = json!({
                        "job_id": upsert.job_id,
                        "inserted": upsert.inserted,
                        "record_sha256": artifact.sha256,
                    });
                    let digest = Some(artifact.sha256.clone());
                    Ok::<_, StepError>(StepOutput::new((artifact.clone(), upsert), digest)
                        .details(details)
                        .artifacts(std::slice::from_ref(&artifact)))
                }
            })
            .await?;

        Ok(Completed {
            canonical_url: canonical,
            final_url,
            platform,
            content_hash,
            record: artifact,
            upsert,
        })
    }

    /// The step envelope.
    async fn run_step<T, F, Fut>(
        &self,
        run: &mut RunContext,
        step: Step,
        input_digest: Option<String>,
        op: F,
    ) -> Result<T, StepFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<StepOutput<T>, StepError>>,
    {
        if run.cancel.is_cancelled() {
            return Err(StepFailure {
                step: Some(step),
                error: StepError::Cancelled,
                attempts: 0,
            });
        }

        let name = step.as_str();
        tracing::debug!(step = name, "step started");

        let RunContext {
            logger,
            machine,
            cancel,
            ..
        } = run;

        logger
            .record(EventDraft::new(name, AuditStatus::Started).input_digest(input_digest.clone()))
            .map_err(|e| StepFailure::audit(step, e))?;

        let mut audit_error = None;
        let result = self
            .policy
            .run(cancel, self.config.step_timeout(name), op, |notice| {
                if audit_error.is_some() {
                    return;
                }
                tracing::warn!(step = name, attempt = notice.attempt, error = %notice.error, "step attempt failed; retrying");
                let draft = EventDraft::new(name, AuditStatus::Retried)
                    .input_digest(input_digest.clone())
                    .details(json!({
                        "attempt": notice.attempt,
                        "delay_ms": notice.delay.as_millis() as u64,
                        "error": notice.error.to_string(),
                        "error_kind": notice.error.kind(),
                    }));
                if let Err(e) = logger.record(draft) {
                    audit_error = Some(e);
                }
            })
            .await;
        if let Some(e) = audit_error {
            return Err(StepFailure::audit(step, e));
        }

        match result {
            Ok(attempted) => {
                let output = attempted.value;
                let mut details = output.details;
                if let Value::Object(map) = &mut details {
                    map.insert("attempts".into(), json!(attempted.attempts));
                }
                logger
                    .record(
                        EventDraft::new(name, AuditStatus::Succeeded)
                            .input_digest(input_digest)
                            .output_digest(output.output_digest)
                            .artifact_paths(output.artifact_paths)
                            .details(details),
                    )
                    .map_err(|e| StepFailure::audit(step, e))?;
                if let Err(e) = machine.advance(step.target_state()) {
                    return Err(StepFailure {
                        step: Some(step),
                        error: StepError::Fatal(e.to_string()),
                        attempts: attempted.attempts,
                    });
                }
                tracing::debug!(step = name, attempts = attempted.attempts, "step succeeded");
                self.flush_audit(logger).await;
                Ok(output.value)
            }
            Err(failure) => {
                tracing::warn!(step = name, attempts = failure.attempts, error = %failure.error, "step failed");
                logger
                    .record(
                        EventDraft::new(name, AuditStatus::Failed)
                            .input_digest(input_digest)
                            .details(json!({
                                "attempts": failure.attempts,
                                "error": failure.error.to_string(),
                                "error_kind": failure.error.kind(),
                            })),
                    )
                    .map_err(|e| StepFailure::audit(step, e))?;
                self.flush_audit(logger).await;
                Err(StepFailure {
                    step: Some(step),
                    error: failure.error,
                    attempts: failure.attempts,
                })
            }
        }
    }

    async fn finish_success(
        &self,
        run: &mut RunContext,
        completed: Completed,
    ) -> Result<RunOutcome, OrchestratorError> {
        if let Err(e) = run.machine.advance(RunState::Completed) {
            tracing::warn!(error = %e, "run finished outside the success path");
        }
        run.logger.record(
            EventDraft::new("run", AuditStatus::Succeeded)
                .output_digest(Some(completed.content_hash.clone()))
                .artifact_paths(vec![completed.record.path.to_string_lossy().into_owned()])
                .details(json!({
                    "canonical_url": completed.canonical_url,
                    "final_url": completed.final_url,
                    "platform": completed.platform,
                    "job_id": completed.upsert.job_id,
                    "inserted": completed.upsert.inserted,
                })),
        )?;

        let id = run.run_id.clone();
        self.store_call(move |db| db.update_run_status(&id, RunStatus::Succeeded, None, None))
            .await?;
        self.flush_audit(&mut run.logger).await;

        tracing::info!(
            content_hash = %completed.content_hash,
            job_id = completed.upsert.job_id,
            inserted = completed.upsert.inserted,
            "run succeeded"
        );
        Ok(RunOutcome::Completed(RunSummary {
            run_id: run.run_id.clone(),
            status: RunStatus::Succeeded,
            url: run.url.clone(),
            canonical_url: completed.canonical_url,
            final_url: completed.final_url,
            platform: completed.platform,
            extractor_mode: self.collaborators.extractor.mode(),
            content_hash: completed.content_hash,
            artifacts_dir: self.ledger.run_dir(&run.run_id),
            job_record_path: completed.record.path,
            job_id: completed.upsert.job_id,
            job_inserted: completed.upsert.inserted,
            audit_events: run.logger.chain().len(),
        }))
    }

    async fn finish_failure(
        &self,
        run: &mut RunContext,
        failure: StepFailure,
    ) -> Result<RunOutcome, OrchestratorError> {
        run.machine.fail();
        let kind = failure.error.kind();
        let timed_out = run.timed_out.load(Ordering::SeqCst);
        let message = if timed_out && kind == ErrorKind::Cancelled {
            "run timeout exceeded".to_string()
        } else {
            failure.error.to_string()
        };
        let step = failure.step.map(|s| s.as_str().to_string());

        let suspend = kind == ErrorKind::LoginRequired && self.config.toml.auth.allow_manual_login;
        let token = suspend.then(|| {
            ResumeToken::new(
                &run.run_id,
                run.canonical_url.as_deref().unwrap_or(&run.url),
                &run.host,
            )
        });

        run.logger.record(
            EventDraft::new("run", AuditStatus::Failed).details(json!({
                "step": step,
                "error_kind": kind,
                "error": message,
                "attempts": failure.attempts,
                "suspended": token.is_some(),
                "timed_out": timed_out,
            })),
        )?;

        let (id, kind_str, msg) = (run.run_id.clone(), kind.as_str().to_string(), message.clone());
        self.store_call(move |db| {
            db.update_run_status(&id, RunStatus::Failed, Some(&kind_str), Some(&msg))
        })
        .await?;
        self.flush_audit(&mut run.logger).await;

        tracing::warn!(error_kind = %kind, step = ?step, error = %message, "run failed");
        let artifacts_dir = self.ledger.run_dir(&run.run_id);
        let audit_events = run.logger.chain().len();
        Ok(match token {
            Some(token) => RunOutcome::LoginRequired(LoginSuspension {
                run_id: run.run_id.clone(),
                status: RunStatus::Failed,
                url: run.url.clone(),
                host: run.host.clone(),
                error_kind: kind,
                resume_token: token.encode(),
                artifacts_dir,
                audit_events,
            }),
            None => RunOutcome::Failed(RunFailure {
                run_id: run.run_id.clone(),
                status: RunStatus::Failed,
                url: run.url.clone(),
                canonical_url: run.canonical_url.clone(),
                final_url: run.final_url.clone(),
                error_kind: kind,
                error_message: message,
                failed_step: step,
                attempts: failure.attempts,
                artifacts_dir,
                audit_events,
            }),
        })
    }

    /// Mirror queued audit events into the store. The trail file stays
    /// authoritative; events that fail to mirror are queued again.
    async fn flush_audit(&self, logger: &mut AuditLogger) {
        let events = logger.take_unflushed();
        if events.is_empty() {
            return;
        }
        let batch = Arc::new(events.clone());
        match self
            .store_call(move |db| db.insert_audit_events(&batch))
            .await
        {
            Ok(inserted) => tracing::trace!(inserted, "mirrored audit events"),
            Err(e) => {
                tracing::warn!(error = %e, pending = events.len(), "could not mirror audit events");
                logger.requeue(events);
            }
        }
    }

    /// Store call retried on `Conflict` under the run's retry policy.
    async fn store_call<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: Fn(&mut Store) -> Result<R, StoreError> + Clone + Send + 'static,
        R: Send + 'static,
    {
        let mut attempt = 1;
        loop {
            let f = f.clone();
            match self.db.call(move |s| f(s)).await {
                Err(StoreError::Conflict(msg)) if attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    tracing::debug!(attempt, error = %msg, "store busy; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Whether `html` is a login wall for a host configured with `domain`.
fn login_gate(domain: Option<&DomainAuth>, html: &str, has_session: bool) -> bool {
    let Some(domain) = domain else {
        return false;
    };
    if domain.logged_in_markers.iter().any(|s| dom::matches(html, s)) {
        return false;
    }
    domain.login_markers.iter().any(|s| dom::matches(html, s))
        || (domain.requires_login && !has_session)
}

/// Click expansion controls; when nothing grew, scroll to the bottom and
/// try once more.
async fn expand_description(
    browser: &dyn Browser,
    page: &PageHandle,
    options: &ExpandOptions,
    wait_limit: Duration,
) -> Result<StepOutput<String>, StepError> {
    let mut ready = false;
    for root in &options.description_roots {
        if browser.wait_for(page, root, wait_limit).await? {
            ready = true;
            break;
        }
    }

    let mut report = browser.expand(page, options).await?;
    let mut scrolled = false;
    if !report.expanded {
        browser.scroll_to_bottom(page).await?;
        scrolled = true;
        let second = browser.expand(page, options).await?;
        report = ExpansionReport {
            expanded: second.expanded,
            clicks: report.clicks + second.clicks,
            before_len: report.before_len,
            after_len: second.after_len,
            selectors_tried: merge_tried(report.selectors_tried, second.selectors_tried),
        };
    }

    let bytes = browser.snapshot(page).await?;
    let html = String::from_utf8_lossy(&bytes).into_owned();
    let details = json!({
        "description_ready": ready,
        "expanded": report.expanded,
        "clicks": report.clicks,
        "before_len": report.before_len,
        "after_len": report.after_len,
        "selectors_tried": report.selectors_tried,
        "scrolled": scrolled,
    });
    Ok(StepOutput::new(html, Some(sha256_hex(&bytes))).details(details))
}

fn merge_tried(mut first: Vec<String>, second: Vec<String>) -> Vec<String> {
    for selector in second {
        if !first.contains(&selector) {
            first.push(selector);
        }
    }
    first
}

/// Register an artifact, accepting an identical copy left by an earlier
/// attempt of the same step.
fn register_once(
    ledger: &ArtifactLedger,
    run_id: &str,
    kind: ArtifactKind,
    bytes: &[u8],
) -> Result<Artifact, ArtifactError> {
    match ledger.register(run_id, kind, bytes) {
        Err(ArtifactError::AlreadyExists { path }) => {
            let stored = sha256_file(&path).map_err(|source| ArtifactError::Io {
                path: path.clone(),
                source,
            })?;
            if stored != sha256_hex(bytes) {
                return Err(ArtifactError::AlreadyExists { path });
            }
            Ok(Artifact {
                run_id: run_id.to_string(),
                kind,
                path,
                sha256: stored,
                created_at: Utc::now(),
            })
        }
        other => other,
    }
}

/// Path of `<artifacts>/<run_id>` for a run id or an explicit directory.
pub fn resolve_run_dir(artifacts_dir: &Path, run: &str) -> PathBuf {
    let candidate = PathBuf::from(run);
    if candidate.is_dir() {
        candidate
    } else {
        artifacts_dir.join(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fixture::BLANK_PNG;

    fn domain(login: &[&str], logged_in: &[&str], requires_login: bool) -> DomainAuth {
        DomainAuth {
            login_markers: login.iter().map(|s| s.to_string()).collect(),
            logged_in_markers: logged_in.iter().map(|s| s.to_string()).collect(),
            requires_login,
        }
    }

    #[test]
    fn test_login_gate_markers() {
        let wall = r#"<form class="login__form"><input id="session_key"></form>"#;
        let member = r#"<div class="global-nav__me"></div><form class="login__form"></form>"#;
        let d = domain(&["form.login__form"], &[".global-nav__me"], false);

        assert!(login_gate(Some(&d), wall, false));
        assert!(!login_gate(Some(&d), member, false));
        assert!(!login_gate(Some(&d), "<h1>Engineer</h1>", false));
        assert!(!login_gate(None, wall, false));
    }

    #[test]
    fn test_required_login_without_session() {
        let d = domain(&[], &[], true);
        assert!(login_gate(Some(&d), "<h1>Engineer</h1>", false));
        assert!(!login_gate(Some(&d), "<h1>Engineer</h1>", true));
    }

    #[test]
    fn test_register_once_accepts_identical_retry() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ArtifactLedger::new(dir.path());
        let first = register_once(&ledger, "run-1", ArtifactKind::Screenshot, BLANK_PNG).unwrap();
        let again = register_once(&ledger, "run-1", ArtifactKind::Screenshot, BLANK_PNG).unwrap();
        assert_eq!(first.sha256, again.sha256);
        assert_eq!(first.path, again.path);

        let err = register_once(&ledger, "run-1", ArtifactKind::Screenshot, b"other").unwrap_err();
        assert!(matches!(err, ArtifactError::AlreadyExists { .. }));
    }

    #[test]
    fn test_merge_tried_keeps_order_without_duplicates() {
        let merged = merge_tried(
            vec!["a".into(), "b".into()],
            vec!["b".into(), "c".into()],
        );
        assert_eq!(merged, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_resolve_run_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            resolve_run_dir(Path::new("/artifacts"), "run-1"),
            PathBuf::from("/artifacts/run-1")
        );
        let explicit = dir.path().to_string_lossy().into_owned();
        assert_eq!(resolve_run_dir(Path::new("/artifacts"), &explicit), dir.path());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_unwritable_trail_still_closes_the_run() {
        use crate::config::JobtrailToml;
        use crate::errors::AuditError;

        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_toml(dir.path().to_path_buf(), JobtrailToml::default());
        let db = DbHandle::new(Store::open_in_memory().unwrap());
        let orchestrator = RunOrchestrator::new(
            Arc::new(config),
            Collaborators {
                browser: Arc::new(FixtureBrowser::from_html("<h1>Engineer</h1>")),
                detector: Arc::new(HeuristicDetector::new()),
                extractor: Arc::new(RuleExtractor::new()),
            },
            db.clone(),
        );
        // Every write to /dev/full fails with ENOSPC.
        let full = std::fs::OpenOptions::new().write(true).open("/dev/full").unwrap();
        let logger = AuditLogger::from_parts("run-1", PathBuf::from("/dev/full"), full);

        let err = orchestrator
            .execute_run(
                "run-1".to_string(),
                "https://careers.example.com/jobs/1",
                logger,
                RunOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Audit(AuditError::Io { .. })));

        let run = db.lock_sync().unwrap().get_run("run-1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_kind.as_deref(), Some("transient_io_error"));
        assert!(run.error_message.unwrap().contains("/dev/full"));
        assert!(run.finished_at.is_some());
    }
}
