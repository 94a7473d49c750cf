//! Configuration view and validation commands: `jobtrail config`.

use anyhow::Result;
use std::path::Path;

use jobtrail::config::Config;

use super::super::ConfigCommands;
use super::{EXIT_FAILED, EXIT_OK};

pub fn cmd_config_init(project_dir: &Path) -> Result<()> {
    let (path, created) = Config::init(project_dir)?;
    if created {
        println!("Created {}", path.display());
    } else {
        println!("{} already exists; left unchanged", path.display());
    }
    Ok(())
}

pub fn cmd_config(config: &Config, command: Option<ConfigCommands>) -> Result<i32> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let config_path = config.config_file();
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No jobtrail.toml at {}; showing defaults", config_path.display());
            }
            println!("# Effective values (with env overrides)");
            println!("# artifacts dir: {}", config.artifacts_dir().display());
            println!("# database:      {}", config.db_path().display());
            println!("# sessions dir:  {}", config.sessions_dir().display());
            println!("# cfg_hash:      {}", config.cfg_hash());
            println!();
            print!("{}", toml::to_string_pretty(&config.toml)?);
            Ok(EXIT_OK)
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
                Ok(EXIT_OK)
            } else {
                println!("Configuration warnings:");
                for warning in &warnings {
                    println!("  - {}", warning);
                }
                Ok(EXIT_FAILED)
            }
        }
        Some(ConfigCommands::Init) => {
            cmd_config_init(&config.project_dir)?;
            Ok(EXIT_OK)
        }
    }
}
