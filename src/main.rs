use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use genforge::config::DEFAULT_CONFIG_PATH;

mod cmd;

#[derive(Parser)]
#[command(name = "genforge")]
#[command(version, about = "Generation orchestrator - runs isolated workers and relays their progress")]
pub struct Cli {
    /// Path to genforge.toml
    #[arg(long, global = true, env = "GENFORGE_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the relay server
    Serve {
        /// Port to serve on (overrides config and GENFORGE_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path (overrides config and GENFORGE_DB_PATH)
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (bind 0.0.0.0, permissive CORS)
        #[arg(long)]
        dev: bool,
    },
    /// Create the job database and a default config file
    Init {
        /// Database path (overrides config)
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Inspect stored jobs
    Jobs {
        #[command(subcommand)]
        command: JobsCommands,
    },
    /// Show or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum JobsCommands {
    /// List an owner's most recent jobs
    List {
        /// Owner id
        #[arg(long)]
        owner: String,

        /// Maximum number of jobs
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Show one job as JSON
    Show { id: i64 },
    /// List the iteration snapshots of a job
    Snapshots { id: i64 },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and report problems
    Validate,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match &cli.command {
        Commands::Serve { port, db_path, dev } => {
            cmd::cmd_serve(&cli.config, *port, db_path.clone(), *dev).await?;
        }
        Commands::Init { db_path } => cmd::cmd_init(&cli.config, db_path.clone())?,
        Commands::Jobs { command } => cmd::cmd_jobs(&cli.config, command.clone()).await?,
        Commands::Config { command } => cmd::cmd_config(&cli.config, command.clone())?,
    }

    Ok(())
}
