use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

/// Everything a runner needs to start one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    pub job_id: i64,
    pub instruction: String,
    /// WebSocket address the worker dials back to.
    pub relay_url: String,
}

/// Identifies a launched worker so it can be polled, drained and stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskHandle {
    Container { job_id: i64, container_id: String },
    Process { job_id: i64, pid: Option<u32> },
}

impl TaskHandle {
    pub fn job_id(&self) -> i64 {
        match self {
            TaskHandle::Container { job_id, .. } | TaskHandle::Process { job_id, .. } => *job_id,
        }
    }
}

/// Launches and manages isolated workers.
/// Real implementations: `DockerTaskRunner`, `LocalProcessRunner`.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn launch(&self, request: LaunchRequest) -> Result<TaskHandle>;

    /// True if the task exited within `timeout`.
    async fn poll_until_terminal(&self, handle: &TaskHandle, timeout: Duration) -> bool;

    /// Copy the worker's output onto the host and return the local path.
    async fn fetch_output(&self, job_id: i64, handle: &TaskHandle) -> Result<PathBuf>;

    /// Best-effort stop and release. Never fails.
    async fn terminate(&self, handle: &TaskHandle);

    /// Recent worker output for failure reports.
    async fn fetch_diagnostics(&self, handle: &TaskHandle) -> String;
}

/// Number of trailing log lines kept in diagnostics.
pub const DIAGNOSTIC_LINES: usize = 200;

pub fn job_dir(work_dir: &Path, job_id: i64) -> PathBuf {
    work_dir.join(format!("job-{}", job_id))
}

/// Environment handed to every worker, regardless of runner.
pub fn worker_env(request: &LaunchRequest, output_dir: &str) -> Vec<(String, String)> {
    vec![
        ("GENFORGE_JOB_ID".to_string(), request.job_id.to_string()),
        ("GENFORGE_RELAY_URL".to_string(), request.relay_url.clone()),
        ("GENFORGE_INSTRUCTION".to_string(), request.instruction.clone()),
        ("GENFORGE_OUTPUT_DIR".to_string(), output_dir.to_string()),
    ]
}

/// Keep only the last `n` lines of `text`.
pub fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_env_names() {
        let req = LaunchRequest {
            job_id: 42,
            instruction: "build a todo app".into(),
            relay_url: "ws://host:3141/relay/worker/42".into(),
        };
        let env = worker_env(&req, "/workspace/output");
        let keys: Vec<&str> = env.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "GENFORGE_JOB_ID",
                "GENFORGE_RELAY_URL",
                "GENFORGE_INSTRUCTION",
                "GENFORGE_OUTPUT_DIR"
            ]
        );
        assert_eq!(env[0].1, "42");
    }

    #[test]
    fn test_tail_lines() {
        let text = (1..=5).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        assert_eq!(tail_lines(&text, 2), "4\n5");
        assert_eq!(tail_lines(&text, 10), text);
        assert_eq!(tail_lines("", 3), "");
    }

    #[test]
    fn test_handle_job_id() {
        let handle = TaskHandle::Container {
            job_id: 7,
            container_id: "abc".into(),
        };
        assert_eq!(handle.job_id(), 7);
        assert_eq!(TaskHandle::Process { job_id: 3, pid: None }.job_id(), 3);
    }
}
