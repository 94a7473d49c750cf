//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                     |
//! |-----------|--------------------------------------|
//! | `run`     | `Run`, `Batch`                       |
//! | `verify`  | `VerifyAudit`, `VerifyArtifacts`     |
//! | `auth`    | `Auth`                               |
//! | `config`  | `Config`                             |
//!
//! Commands print machine-readable JSON on stdout and return the process
//! exit code.

pub mod auth;
pub mod config;
pub mod run;
pub mod verify;

pub use auth::cmd_auth;
pub use config::{cmd_config, cmd_config_init};
pub use run::{cmd_batch, cmd_run};
pub use verify::{cmd_verify_artifacts, cmd_verify_audit};

pub const EXIT_OK: i32 = 0;
/// A run failed, or a verification found a mismatch.
pub const EXIT_FAILED: i32 = 1;
/// The run, audit trail or artifact records do not exist.
pub const EXIT_MISSING: i32 = 2;
/// A run stopped because the host needs an interactive login.
pub const EXIT_LOGIN_REQUIRED: i32 = 3;

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
