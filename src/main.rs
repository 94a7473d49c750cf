use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobtrail::config::{CliOverrides, Config};
use jobtrail::logging::{LogOptions, init_logging};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "jobtrail")]
#[command(version, about = "Auditable job posting capture")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    #[arg(long, global = true, env = "JOBTRAIL_PROJECT_DIR")]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(clap::Args, Clone, Debug, Default)]
pub struct RunFlags {
    /// Do not capture a screenshot
    #[arg(long)]
    pub no_screenshot: bool,

    /// Do not keep the raw HTML before and after expansion
    #[arg(long)]
    pub no_html: bool,

    /// Abort the run after this many milliseconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Disable the model-assisted extractor
    #[arg(long)]
    pub no_llm: bool,

    /// Serve this HTML file instead of fetching the URL
    #[arg(long)]
    pub fixture: Option<PathBuf>,
}

impl RunFlags {
    fn overrides(&self, concurrency: Option<usize>) -> CliOverrides {
        CliOverrides {
            no_screenshot: self.no_screenshot,
            no_html: self.no_html,
            timeout_ms: self.timeout,
            no_llm: self.no_llm,
            concurrency,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture one job posting
    Run {
        /// Job posting URL; may be omitted with --resume
        url: Option<String>,

        /// Resume token printed by a run that stopped for login
        #[arg(long)]
        resume: Option<String>,

        #[command(flatten)]
        flags: RunFlags,
    },
    /// Capture every URL listed in a file, one per line
    Batch {
        file: PathBuf,

        /// Maximum runs in flight
        #[arg(short, long)]
        concurrency: Option<usize>,

        #[command(flatten)]
        flags: RunFlags,
    },
    /// Verify the hash chain of a run's audit trail
    VerifyAudit {
        /// Run id or run directory
        #[arg(long)]
        run: String,
    },
    /// Re-hash a run's artifacts and compare them with the recorded digests
    VerifyArtifacts {
        #[arg(long)]
        run: String,
    },
    /// Manage stored login sessions
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum AuthCommands {
    /// Store a session exported from a logged-in browser
    Import {
        #[arg(long)]
        host: String,
        /// JSON file holding a session state or a cookie array
        #[arg(long)]
        file: PathBuf,
    },
    /// Show the stored session of a host
    Status {
        #[arg(long)]
        host: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the resolved configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default jobtrail.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    if let Commands::Config {
        command: Some(ConfigCommands::Init),
    } = &cli.command
    {
        return cmd::cmd_config_init(&project_dir);
    }

    let mut config = Config::new(project_dir)?;
    config.verbose = cli.verbose;

    let guard = init_logging(
        &LogOptions {
            level: config.toml.logging.level.clone(),
            json: cli.log_json || config.toml.logging.json,
            verbose: cli.verbose,
            file: config.toml.logging.file.clone(),
        },
        &config.log_dir(),
    )?;

    let code = match &cli.command {
        Commands::Run { url, resume, flags } => {
            cmd::cmd_run(
                config,
                url.clone(),
                resume.as_deref(),
                flags.fixture.clone(),
                &flags.overrides(None),
            )
            .await?
        }
        Commands::Batch {
            file,
            concurrency,
            flags,
        } => {
            cmd::cmd_batch(
                config,
                file,
                flags.fixture.clone(),
                &flags.overrides(*concurrency),
            )
            .await?
        }
        Commands::VerifyAudit { run } => cmd::cmd_verify_audit(&config, run)?,
        Commands::VerifyArtifacts { run } => cmd::cmd_verify_artifacts(&config, run)?,
        Commands::Auth { command } => cmd::cmd_auth(&config, command.clone()).await?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    };

    // Flush the file log before exiting with a status code.
    drop(guard);
    if code != cmd::EXIT_OK {
        std::process::exit(code);
    }
    Ok(())
}
