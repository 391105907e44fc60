//! Database and config bootstrap (`genforge init`).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use genforge::relay::db::DbHandle;

pub fn cmd_init(config_path: &Path, db_path: Option<PathBuf>) -> Result<()> {
    let mut config = super::load_config(config_path)?;
    if let Some(db_path) = db_path {
        config.database.path = db_path;
    }

    DbHandle::open(&config.database.path)?;
    println!(
        "Initialized genforge database at {}",
        config.database.path.display()
    );

    if config_path.exists() {
        println!("Config already exists at {}", config_path.display());
        return Ok(());
    }
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(config_path, config.to_toml()?)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    println!("Created config at {}", config_path.display());
    Ok(())
}
