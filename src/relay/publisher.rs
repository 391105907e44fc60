use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::config::PublisherSection;

#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub job_id: i64,
    pub owner_id: String,
    pub instruction: String,
    /// Host directory holding the generated project.
    pub source_dir: PathBuf,
}

/// Publishes a generated project and returns its public URL.
#[async_trait]
pub trait RepositoryPublisher: Send + Sync {
    async fn publish(&self, request: &PublishRequest) -> Result<String>;
}

/// Creates a GitHub repository with `gh repo create --push`.
pub struct GhCliPublisher {
    config: PublisherSection,
}

impl GhCliPublisher {
    pub fn new(config: PublisherSection) -> Self {
        Self { config }
    }

    pub fn repo_name(&self, request: &PublishRequest) -> String {
        let slug = slugify(&request.instruction, 30);
        let name = if slug.is_empty() {
            format!("{}{}", self.config.repo_prefix, request.job_id)
        } else {
            format!("{}{}-{}", self.config.repo_prefix, request.job_id, slug)
        };
        match &self.config.owner {
            Some(owner) => format!("{}/{}", owner, name),
            None => name,
        }
    }
}

/// Convert text to a URL-safe slug, limited to `max_len` characters.
pub fn slugify(text: &str, max_len: usize) -> String {
    let slug: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

async fn run(program: &str, args: &[&str], dir: &Path) -> Result<String> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .current_dir(dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("Failed to run {} {}", program, args.join(" ")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("{} {} failed: {}", program, args.first().unwrap_or(&""), stderr.trim());
    }
    String::from_utf8(output.stdout).context("Invalid UTF-8 in command output")
}

#[async_trait]
impl RepositoryPublisher for GhCliPublisher {
    async fn publish(&self, request: &PublishRequest) -> Result<String> {
        let dir = request.source_dir.as_path();
        let repo = self.repo_name(request);
        let message = format!("Generated project for job {}", request.job_id);

        run("git", &["init", "-q"], dir).await?;
        run("git", &["add", "-A"], dir).await?;
        run(
            "git",
            &[
                "-c",
                "user.name=genforge",
                "-c",
                "user.email=genforge@localhost",
                "commit",
                "-q",
                "-m",
                &message,
            ],
            dir,
        )
        .await?;

        let visibility = if self.config.private {
            "--private"
        } else {
            "--public"
        };
        let stdout = run(
            "gh",
            &[
                "repo",
                "create",
                &repo,
                visibility,
                "--source",
                ".",
                "--push",
            ],
            dir,
        )
        .await?;

        let url = stdout
            .lines()
            .map(str::trim)
            .find(|l| l.starts_with("https://"))
            .map(str::to_string)
            .with_context(|| format!("gh repo create printed no URL for {}", repo))?;

        tracing::info!(job_id = request.job_id, url = %url, "Published generated project");
        Ok(url)
    }
}
