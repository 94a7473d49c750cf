//! Configuration for jobtrail.
//!
//! Reads `.jobtrail/jobtrail.toml` inside the project directory. Every section
//! is optional; values are layered file → environment → CLI and the result is
//! a single immutable [`Config`] threaded into the orchestrator.
//!
//! # Configuration File Format
//!
//! ```toml
//! [artifacts]
//! base_dir = "artifacts"
//! keep_raw_before_after = true
//! screenshot = true
//!
//! [database]
//! path = "jobtrail.db"
//!
//! [retries]
//! max_attempts = 3
//! backoff_initial_ms = 300
//! backoff_max_ms = 3000
//!
//! [timeouts]
//! step_ms = 30000
//! run_ms = 300000
//!
//! [timeouts.steps]
//! session = 45000
//!
//! [auth]
//! sessions_dir = "sessions"
//! allow_manual_login = true
//! session_ttl_s = 604800
//!
//! [auth.domains."www.linkedin.com"]
//! login_markers = ["form.login__form", "#session_key"]
//! logged_in_markers = [".global-nav__me"]
//!
//! [expand]
//! max_clicks = 4
//! stabilize_ms = 700
//! min_delta_chars = 200
//!
//! [expand.selectors]
//! lever = ["button.show-more"]
//!
//! [workers]
//! concurrency = 4
//! ```

use crate::adapters::ExpandOptions;
use crate::hashing::digest_json;
use crate::platform::Platform;
use crate::retry::RetryPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the project-local directory holding config, database and artifacts.
pub const JOBTRAIL_DIR: &str = ".jobtrail";

/// Name of the config file inside [`JOBTRAIL_DIR`].
pub const CONFIG_FILE: &str = "jobtrail.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactsSection {
    /// Root of the per-run directories. Relative paths resolve against `.jobtrail/`.
    #[serde(default = "default_artifacts_base_dir")]
    pub base_dir: PathBuf,
    /// Store `raw.before.html` / `raw.after.html`.
    #[serde(default = "default_true")]
    pub keep_raw_before_after: bool,
    #[serde(default = "default_true")]
    pub screenshot: bool,
}

fn default_artifacts_base_dir() -> PathBuf {
    PathBuf::from("artifacts")
}

fn default_true() -> bool {
    true
}

impl Default for ArtifactsSection {
    fn default() -> Self {
        Self {
            base_dir: default_artifacts_base_dir(),
            keep_raw_before_after: true,
            screenshot: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("jobtrail.db")
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetriesSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_initial_ms() -> u64 {
    300
}

fn default_backoff_max_ms() -> u64 {
    3000
}

impl Default for RetriesSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsSection {
    /// Per-attempt timeout applied to every step without its own entry.
    #[serde(default = "default_step_ms")]
    pub step_ms: u64,
    /// Ceiling for a whole run.
    #[serde(default)]
    pub run_ms: Option<u64>,
    /// Per-step overrides, keyed by step name.
    #[serde(default)]
    pub steps: BTreeMap<String, u64>,
}

fn default_step_ms() -> u64 {
    30_000
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            step_ms: default_step_ms(),
            run_ms: None,
            steps: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserSection {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_nav_timeout_ms")]
    pub nav_timeout_ms: u64,
}

fn default_user_agent() -> String {
    concat!("jobtrail/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_nav_timeout_ms() -> u64 {
    15_000
}

impl Default for BrowserSection {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            nav_timeout_ms: default_nav_timeout_ms(),
        }
    }
}

/// Login-gate markers for one host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainAuth {
    /// Selectors whose presence means the page is a login wall.
    #[serde(default)]
    pub login_markers: Vec<String>,
    /// Selectors whose presence means the session is authenticated.
    #[serde(default)]
    pub logged_in_markers: Vec<String>,
    /// Treat a missing session as a login gate even without markers.
    #[serde(default)]
    pub requires_login: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSection {
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: PathBuf,
    /// Suspend with a resume token instead of failing outright.
    #[serde(default = "default_true")]
    pub allow_manual_login: bool,
    /// Saved sessions older than this are ignored. `0` keeps them forever.
    #[serde(default = "default_session_ttl_s")]
    pub session_ttl_s: u64,
    #[serde(default = "default_domains")]
    pub domains: BTreeMap<String, DomainAuth>,
}

fn default_sessions_dir() -> PathBuf {
    PathBuf::from("sessions")
}

fn default_session_ttl_s() -> u64 {
    7 * 24 * 3600
}

fn default_domains() -> BTreeMap<String, DomainAuth> {
    let mut domains = BTreeMap::new();
    domains.insert(
        "www.linkedin.com".to_string(),
        DomainAuth {
            login_markers: vec![
                "form.login__form".to_string(),
                "#session_key".to_string(),
                ".authwall-join-form".to_string(),
            ],
            logged_in_markers: vec![".global-nav__me".to_string()],
            requires_login: false,
        },
    );
    domains
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            sessions_dir: default_sessions_dir(),
            allow_manual_login: true,
            session_ttl_s: default_session_ttl_s(),
            domains: default_domains(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpandSection {
    #[serde(default = "default_max_clicks")]
    pub max_clicks: u32,
    #[serde(default = "default_stabilize_ms")]
    pub stabilize_ms: u64,
    /// Growth of the description (in characters) that counts as an expansion.
    #[serde(default = "default_min_delta_chars")]
    pub min_delta_chars: usize,
    /// Extra selectors per platform, tried before the built-in ones.
    #[serde(default)]
    pub selectors: BTreeMap<String, Vec<String>>,
}

fn default_max_clicks() -> u32 {
    4
}

fn default_stabilize_ms() -> u64 {
    700
}

fn default_min_delta_chars() -> usize {
    200
}

impl Default for ExpandSection {
    fn default() -> Self {
        Self {
            max_clicks: default_max_clicks(),
            stabilize_ms: default_stabilize_ms(),
            min_delta_chars: default_min_delta_chars(),
            selectors: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractorSection {
    /// Request model-assisted extraction. Without a model backend the rule
    /// extractor runs in degraded mode.
    #[serde(default)]
    pub llm_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersSection {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_concurrency() -> usize {
    4
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Filter directive used when neither `JOBTRAIL_LOG` nor `RUST_LOG` is set.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Daily-rolling log file name inside `.jobtrail/logs/`.
    #[serde(default)]
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file: None,
        }
    }
}

/// The complete jobtrail.toml structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JobtrailToml {
    #[serde(default)]
    pub artifacts: ArtifactsSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub retries: RetriesSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub browser: BrowserSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub expand: ExpandSection,
    #[serde(default)]
    pub extractor: ExtractorSection,
    #[serde(default)]
    pub workers: WorkersSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl JobtrailToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse jobtrail.toml")
    }

    /// Load `<dir>/jobtrail.toml`, or defaults if the file doesn't exist.
    pub fn load_or_default(jobtrail_dir: &Path) -> Result<Self> {
        let config_path = jobtrail_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize jobtrail.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `JOBTRAIL_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("JOBTRAIL_ARTIFACTS_DIR") {
            self.artifacts.base_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("JOBTRAIL_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(attempts) = lookup("JOBTRAIL_MAX_ATTEMPTS") {
            self.retries.max_attempts = attempts
                .trim()
                .parse()
                .with_context(|| format!("JOBTRAIL_MAX_ATTEMPTS is not a number: {}", attempts))?;
        }
        if let Some(level) = lookup("JOBTRAIL_LOG") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.retries.max_attempts == 0 {
            warnings.push("retries.max_attempts = 0: every step is still attempted once".to_string());
        }
        if self.retries.backoff_initial_ms > self.retries.backoff_max_ms {
            warnings.push(format!(
                "retries.backoff_initial_ms ({}) exceeds backoff_max_ms ({}); every delay is capped",
                self.retries.backoff_initial_ms, self.retries.backoff_max_ms
            ));
        }
        if self.timeouts.step_ms == 0 {
            warnings.push("timeouts.step_ms = 0 disables per-step timeouts".to_string());
        }
        for step in self.timeouts.steps.keys() {
            if !crate::orchestrator::Step::ALL.iter().any(|s| s.as_str() == step) {
                warnings.push(format!("timeouts.steps.{} does not name a step", step));
            }
        }
        if let Some(run_ms) = self.timeouts.run_ms
            && run_ms < self.timeouts.step_ms
        {
            warnings.push(format!(
                "timeouts.run_ms ({}) is shorter than timeouts.step_ms ({})",
                run_ms, self.timeouts.step_ms
            ));
        }
        for platform in self.expand.selectors.keys() {
            if platform.parse::<Platform>().is_err() {
                warnings.push(format!("expand.selectors.{} is not a known platform", platform));
            }
        }
        for (host, domain) in &self.auth.domains {
            if domain.login_markers.is_empty() && !domain.requires_login {
                warnings.push(format!(
                    "auth.domains.\"{}\" has no login_markers and never requires login",
                    host
                ));
            }
        }
        if self.workers.concurrency == 0 {
            warnings.push("workers.concurrency = 0: batches run one URL at a time".to_string());
        }

        warnings
    }
}

/// Per-invocation overrides from the command line.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub no_screenshot: bool,
    pub no_html: bool,
    pub timeout_ms: Option<u64>,
    pub no_llm: bool,
    pub concurrency: Option<usize>,
}

/// Resolved configuration: jobtrail.toml merged with environment and CLI.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub jobtrail_dir: PathBuf,
    pub toml: JobtrailToml,
    pub verbose: bool,
}

impl Config {
    /// Load configuration for a project directory (file → `.env` → environment).
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let jobtrail_dir = project_dir.join(JOBTRAIL_DIR);

        // `.env` never overrides variables that are already set.
        let _ = dotenvy::from_path(project_dir.join(".env"));

        let mut toml = JobtrailToml::load_or_default(&jobtrail_dir)?;
        toml.apply_env(|key| std::env::var(key).ok())?;

        Ok(Self {
            project_dir,
            jobtrail_dir,
            toml,
            verbose: false,
        })
    }

    /// Build a configuration from an already-parsed file, without touching
    /// the environment.
    pub fn from_toml(project_dir: PathBuf, toml: JobtrailToml) -> Self {
        Self {
            jobtrail_dir: project_dir.join(JOBTRAIL_DIR),
            project_dir,
            toml,
            verbose: false,
        }
    }

    /// Load configuration and apply CLI overrides.
    pub fn with_cli_args(project_dir: PathBuf, verbose: bool, overrides: &CliOverrides) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        config.apply_overrides(overrides);
        Ok(config)
    }

    pub fn apply_overrides(&mut self, overrides: &CliOverrides) {
        if overrides.no_screenshot {
            self.toml.artifacts.screenshot = false;
        }
        if overrides.no_html {
            self.toml.artifacts.keep_raw_before_after = false;
        }
        if let Some(ms) = overrides.timeout_ms {
            self.toml.timeouts.run_ms = Some(ms);
        }
        if overrides.no_llm {
            self.toml.extractor.llm_enabled = false;
        }
        if let Some(concurrency) = overrides.concurrency {
            self.toml.workers.concurrency = concurrency;
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.jobtrail_dir.join(path)
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.jobtrail_dir.join(CONFIG_FILE)
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.resolve(&self.toml.artifacts.base_dir)
    }

    pub fn db_path(&self) -> PathBuf {
        self.resolve(&self.toml.database.path)
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.resolve(&self.toml.auth.sessions_dir)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.jobtrail_dir.join("logs")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_millis(
            self.toml.retries.max_attempts,
            self.toml.retries.backoff_initial_ms,
            self.toml.retries.backoff_max_ms,
        )
    }

    /// Per-attempt timeout of `step`; `None` when disabled.
    pub fn step_timeout(&self, step: &str) -> Option<Duration> {
        let ms = self
            .toml
            .timeouts
            .steps
            .get(step)
            .copied()
            .unwrap_or(self.toml.timeouts.step_ms);
        (ms > 0).then(|| Duration::from_millis(ms))
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.toml
            .timeouts
            .run_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn session_ttl(&self) -> Option<Duration> {
        let ttl = self.toml.auth.session_ttl_s;
        (ttl > 0).then(|| Duration::from_secs(ttl))
    }

    pub fn nav_timeout(&self) -> Duration {
        Duration::from_millis(self.toml.browser.nav_timeout_ms)
    }

    pub fn domain_auth(&self, host: &str) -> Option<&DomainAuth> {
        self.toml.auth.domains.get(host)
    }

    /// Expansion parameters for `platform`: configured selectors first, then
    /// the platform's built-in ones.
    pub fn expand_options(&self, platform: Platform) -> ExpandOptions {
        let mut selectors: Vec<String> = self
            .toml
            .expand
            .selectors
            .get(platform.as_str())
            .cloned()
            .unwrap_or_default();
        for builtin in platform.expansion_selectors() {
            if !selectors.iter().any(|s| s == builtin) {
                selectors.push((*builtin).to_string());
            }
        }
        ExpandOptions {
            selectors,
            description_roots: platform
                .description_roots()
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            max_clicks: self.toml.expand.max_clicks,
            stabilize: Duration::from_millis(self.toml.expand.stabilize_ms),
            min_delta_chars: self.toml.expand.min_delta_chars,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.toml.workers.concurrency.max(1)
    }

    /// SHA-256 over the canonical JSON of the resolved configuration.
    pub fn cfg_hash(&self) -> String {
        digest_json(&self.toml).unwrap_or_default()
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }

    /// Write a default `jobtrail.toml` unless one already exists.
    /// Returns the config path and whether it was created.
    pub fn init(project_dir: &Path) -> Result<(PathBuf, bool)> {
        let jobtrail_dir = project_dir.join(JOBTRAIL_DIR);
        std::fs::create_dir_all(&jobtrail_dir)
            .with_context(|| format!("Failed to create {}", jobtrail_dir.display()))?;
        let path = jobtrail_dir.join(CONFIG_FILE);
        if path.exists() {
            return Ok((path, false));
        }
        JobtrailToml::default().save(&path)?;
        Ok((path, true))
    }
}
