use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::runner::{
    DIAGNOSTIC_LINES, LaunchRequest, TaskHandle, TaskRunner, job_dir, tail_lines, worker_env,
};
use crate::config::LocalSection;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Runs each worker as a child process on this host.
pub struct LocalProcessRunner {
    config: LocalSection,
    work_dir: PathBuf,
    running: Mutex<HashMap<i64, Child>>,
}

impl LocalProcessRunner {
    pub fn new(config: LocalSection, work_dir: PathBuf) -> Self {
        let work_dir = std::path::absolute(&work_dir).unwrap_or(work_dir);
        Self {
            config,
            work_dir,
            running: Mutex::new(HashMap::new()),
        }
    }

    fn output_dir(&self, job_id: i64) -> PathBuf {
        job_dir(&self.work_dir, job_id).join("output")
    }

    fn log_path(&self, job_id: i64) -> PathBuf {
        job_dir(&self.work_dir, job_id).join("worker.log")
    }
}

#[async_trait]
impl TaskRunner for LocalProcessRunner {
    async fn launch(&self, request: LaunchRequest) -> Result<TaskHandle> {
        let job_id = request.job_id;
        let program = self
            .config
            .command
            .clone()
            .context("runner.local.command is not configured")?;

        let output_dir = self.output_dir(job_id);
        tokio::fs::create_dir_all(&output_dir)
            .await
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;

        let log_path = self.log_path(job_id);
        let log = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create {}", log_path.display()))?;
        let log_err = log.try_clone().context("Failed to clone worker log handle")?;

        let mut cmd = Command::new(&program);
        cmd.args(&self.config.args)
            .current_dir(job_dir(&self.work_dir, job_id))
            .envs(worker_env(&request, &output_dir.to_string_lossy()))
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn worker '{}'", program))?;
        let pid = child.id();
        self.running.lock().await.insert(job_id, child);

        tracing::info!(job_id, pid = ?pid, "Spawned worker process");
        Ok(TaskHandle::Process { job_id, pid })
    }

    async fn poll_until_terminal(&self, handle: &TaskHandle, timeout: Duration) -> bool {
        let TaskHandle::Process { job_id, .. } = handle else {
            return false;
        };
        let poll = async {
            loop {
                {
                    let mut running = self.running.lock().await;
                    match running.get_mut(job_id) {
                        None => return true,
                        Some(child) => match child.try_wait() {
                            Ok(Some(status)) => {
                                tracing::debug!(job_id, status = %status, "Worker process exited");
                                return true;
                            }
                            Ok(None) => {}
                            Err(e) => {
                                tracing::warn!(job_id, error = %e, "Failed to poll worker process");
                                return true;
                            }
                        },
                    }
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.unwrap_or(false)
    }

    async fn fetch_output(&self, job_id: i64, _handle: &TaskHandle) -> Result<PathBuf> {
        let dir = self.output_dir(job_id);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            anyhow::bail!("Worker output directory {} does not exist", dir.display());
        }
        Ok(dir)
    }

    async fn terminate(&self, handle: &TaskHandle) {
        let TaskHandle::Process { job_id, .. } = handle else {
            return;
        };
        let child = self.running.lock().await.remove(job_id);
        if let Some(mut child) = child {
            if let Ok(Some(_)) = child.try_wait() {
                return;
            }
            // kill() also reaps the child.
            if let Err(e) = child.kill().await {
                tracing::warn!(job_id, error = %e, "Failed to kill worker process");
            } else {
                tracing::info!(job_id, "Killed worker process");
            }
        }
    }

    async fn fetch_diagnostics(&self, handle: &TaskHandle) -> String {
        let path = self.log_path(handle.job_id());
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => tail_lines(&content, DIAGNOSTIC_LINES),
            Err(e) => format!("<no worker log at {}: {}>", path.display(), e),
        }
    }
}
