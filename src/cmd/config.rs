//! Configuration view and validation commands (`genforge config`).

use std::path::Path;

use anyhow::Result;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config = super::load_config(config_path)?;

    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No config at {} (using defaults)", config_path.display());
            }
            println!("# Effective values, including GENFORGE_* overrides");
            println!();
            print!("{}", config.to_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            let problems = config.validate();
            if problems.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration problems:");
                for problem in &problems {
                    println!("  - {}", problem);
                }
                anyhow::bail!("Configuration has {} problem(s)", problems.len());
            }
        }
    }
    Ok(())
}
