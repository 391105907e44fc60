//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `serve`  | `Serve`          |
//! | `init`   | `Init`           |
//! | `jobs`   | `Jobs`           |
//! | `config` | `Config`         |

pub mod config;
pub mod init;
pub mod jobs;
pub mod serve;

pub use config::cmd_config;
pub use init::cmd_init;
pub use jobs::cmd_jobs;
pub use serve::cmd_serve;

use anyhow::Result;
use genforge::config::RelayConfig;

/// Config file (or defaults) with `GENFORGE_*` overrides applied.
pub fn load_config(path: &std::path::Path) -> Result<RelayConfig> {
    let mut config = RelayConfig::load_or_default(path)?;
    config.apply_env()?;
    Ok(config)
}
