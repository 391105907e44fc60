//! Service configuration for genforge.
//!
//! Read from `.genforge/genforge.toml`, then layered with environment
//! variables, then CLI flags (applied by `cmd::serve`).
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 3141
//! public_url = "http://relay.internal:3141"
//!
//! [database]
//! path = ".genforge/genforge.db"
//!
//! [timeouts]
//! ready_secs = 60
//! completion_secs = 3600
//!
//! [runner]
//! kind = "docker"
//! work_dir = ".genforge/work"
//!
//! [runner.docker]
//! image = "ghcr.io/acme/genforge-worker:latest"
//! memory = "4g"
//! cpus = 2.0
//!
//! [runner.docker.env]
//! NODE_ENV = "production"
//!
//! [identity.tokens]
//! "dev-token" = "user-1"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = ".genforge/genforge.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub runner: RunnerSection,
    #[serde(default)]
    pub publisher: PublisherSection,
    #[serde(default)]
    pub deploy: DeploySection,
    #[serde(default)]
    pub identity: IdentitySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Address workers use to reach this service. Defaults to `http://{host}:{port}`.
    #[serde(default)]
    pub public_url: Option<String>,
    /// Permissive CORS for local frontends.
    #[serde(default)]
    pub dev_mode: bool,
    /// Log lines kept per session for observer replay.
    #[serde(default = "default_log_buffer")]
    pub log_buffer: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3141
}

fn default_log_buffer() -> usize {
    2000
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: None,
            dev_mode: false,
            log_buffer: default_log_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".genforge/genforge.db")
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsSection {
    #[serde(default = "default_ready_secs")]
    pub ready_secs: u64,
    #[serde(default = "default_completion_secs")]
    pub completion_secs: u64,
    /// Grace period for the task to exit after reporting completion.
    #[serde(default = "default_terminal_grace_secs")]
    pub terminal_grace_secs: u64,
    /// How long a finished session stays around for late observers.
    #[serde(default = "default_session_retention_secs")]
    pub session_retention_secs: u64,
}

fn default_ready_secs() -> u64 {
    60
}

fn default_completion_secs() -> u64 {
    3600
}

fn default_terminal_grace_secs() -> u64 {
    30
}

fn default_session_retention_secs() -> u64 {
    300
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            ready_secs: default_ready_secs(),
            completion_secs: default_completion_secs(),
            terminal_grace_secs: default_terminal_grace_secs(),
            session_retention_secs: default_session_retention_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    #[default]
    Docker,
    Local,
}

impl std::fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerKind::Docker => write!(f, "docker"),
            RunnerKind::Local => write!(f, "local"),
        }
    }
}

impl std::str::FromStr for RunnerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(RunnerKind::Docker),
            "local" => Ok(RunnerKind::Local),
            _ => anyhow::bail!("Invalid runner '{}'. Valid values: docker, local", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSection {
    #[serde(default)]
    pub kind: RunnerKind,
    /// Host directory for per-job output and logs.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Fetch and publish whatever the worker produced when it times out.
    #[serde(default = "default_partial_recovery")]
    pub partial_recovery: bool,
    #[serde(default)]
    pub docker: DockerSection,
    #[serde(default)]
    pub local: LocalSection,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".genforge/work")
}

fn default_partial_recovery() -> bool {
    true
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            kind: RunnerKind::default(),
            work_dir: default_work_dir(),
            partial_recovery: default_partial_recovery(),
            docker: DockerSection::default(),
            local: LocalSection::default(),
        }
    }
}

/// Container settings for `DockerTaskRunner`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerSection {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    /// Directory inside the container that holds the generated project.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_memory() -> String {
    "4g".to_string()
}

fn default_cpus() -> f64 {
    2.0
}

fn default_output_dir() -> String {
    "/workspace/output".to_string()
}

impl Default for DockerSection {
    fn default() -> Self {
        Self {
            image: None,
            memory: default_memory(),
            cpus: default_cpus(),
            output_dir: default_output_dir(),
            env: HashMap::new(),
        }
    }
}

/// Process settings for `LocalProcessRunner`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalSection {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherSection {
    #[serde(default)]
    pub enabled: bool,
    /// GitHub owner (user or org) for created repositories.
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default = "default_private")]
    pub private: bool,
    #[serde(default = "default_repo_prefix")]
    pub repo_prefix: String,
}

fn default_private() -> bool {
    true
}

fn default_repo_prefix() -> String {
    "genforge-".to_string()
}

impl Default for PublisherSection {
    fn default() -> Self {
        Self {
            enabled: false,
            owner: None,
            private: default_private(),
            repo_prefix: default_repo_prefix(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploySection {
    /// Endpoint that receives deployment requests. No trigger when unset.
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Name of the environment variable holding the webhook bearer token.
    #[serde(default)]
    pub token_env: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentitySection {
    /// Static bearer token → user id table.
    #[serde(default)]
    pub tokens: HashMap<String, String>,
    /// Token introspection endpoint; takes precedence over `tokens`.
    #[serde(default)]
    pub introspection_url: Option<String>,
}

impl RelayConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse genforge.toml")
    }

    /// Load from `path`, returning defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply `GENFORGE_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(port) = lookup("GENFORGE_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid GENFORGE_PORT '{}'", port))?;
        }
        if let Some(path) = lookup("GENFORGE_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(url) = lookup("GENFORGE_PUBLIC_URL") {
            self.server.public_url = Some(url);
        }
        if let Some(kind) = lookup("GENFORGE_RUNNER") {
            self.runner.kind = kind.parse()?;
        }
        Ok(())
    }

    /// Base URL workers use to reach the relay.
    pub fn public_url(&self) -> String {
        self.server
            .public_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.server.host, self.server.port))
            .trim_end_matches('/')
            .to_string()
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.ready_secs)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.completion_secs)
    }

    pub fn terminal_grace(&self) -> Duration {
        Duration::from_secs(self.timeouts.terminal_grace_secs)
    }

    pub fn session_retention(&self) -> Duration {
        Duration::from_secs(self.timeouts.session_retention_secs)
    }

    /// Render as TOML for `config show`.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize genforge.toml")
    }

    /// Validate the configuration and return any problems found.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        match self.runner.kind {
            RunnerKind::Docker => {
                if self.runner.docker.image.is_none() {
                    problems.push("runner.docker.image is required for the docker runner".into());
                }
                if parse_memory(&self.runner.docker.memory).is_none() {
                    problems.push(format!(
                        "Invalid runner.docker.memory '{}': expected e.g. '512m' or '4g'",
                        self.runner.docker.memory
                    ));
                }
                if self.runner.docker.cpus <= 0.0 {
                    problems.push("runner.docker.cpus must be positive".into());
                }
                if self.server.public_url.is_none() {
                    problems.push(format!(
                        "server.public_url is unset: containers cannot reach {}; try server.public_url = \"http://host.docker.internal:{}\"",
                        self.public_url(),
                        self.server.port
                    ));
                }
            }
            RunnerKind::Local => {
                if self.runner.local.command.is_none() {
                    problems.push("runner.local.command is required for the local runner".into());
                }
            }
        }

        if self.timeouts.ready_secs == 0 || self.timeouts.completion_secs == 0 {
            problems.push("timeouts.ready_secs and timeouts.completion_secs must be non-zero".into());
        }
        if self.server.log_buffer == 0 {
            problems.push("server.log_buffer must be at least 1".into());
        }
        if let Some(url) = &self.server.public_url
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            problems.push(format!(
                "server.public_url '{}' must start with http:// or https://",
                url
            ));
        }
        if self.identity.tokens.is_empty() && self.identity.introspection_url.is_none() {
            problems.push(
                "No identity source configured: console and job API will reject every token"
                    .into(),
            );
        }

        problems
    }
}

/// Parse a docker-style memory size (`512m`, `4g`, `1024k`, `2048`) into bytes.
pub fn parse_memory(value: &str) -> Option<i64> {
    let value = value.trim().to_lowercase();
    let (digits, multiplier) = match value.chars().last()? {
        'k' => (&value[..value.len() - 1], 1024),
        'm' => (&value[..value.len() - 1], 1024 * 1024),
        'g' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        'b' => (&value[..value.len() - 1], 1),
        _ => (value.as_str(), 1),
    };
    let n: i64 = digits.parse().ok()?;
    if n <= 0 {
        return None;
    }
    n.checked_mul(multiplier)
}
