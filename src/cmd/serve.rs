//! Relay server command (`genforge serve`).

use std::path::{Path, PathBuf};

use anyhow::Result;

pub async fn cmd_serve(
    config_path: &Path,
    port: Option<u16>,
    db_path: Option<PathBuf>,
    dev: bool,
) -> Result<()> {
    let mut config = super::load_config(config_path)?;
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(db_path) = db_path {
        config.database.path = db_path;
    }
    if dev {
        config.server.dev_mode = true;
    }

    genforge::relay::server::start_server(config).await
}
