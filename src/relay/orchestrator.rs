use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::hub::RelayHub;
use super::messages::ObserverEvent;
use super::models::{Job, JobStatus, JobUpdate, NewJob};
use super::publisher::{PublishRequest, RepositoryPublisher};
use super::runner::{LaunchRequest, TaskHandle, TaskRunner};
use super::store::JobStore;
use crate::config::RelayConfig;
use crate::errors::RelayError;

/// Error recorded on jobs a previous relay process left unfinished.
pub const RESTART_ERROR: &str = "Interrupted by relay restart";

/// Error recorded on jobs still running when the relay shuts down.
pub const SHUTDOWN_ERROR: &str = "Interrupted by relay shutdown";

/// Timeouts and addresses that shape one orchestration run.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub public_url: String,
    pub ready_timeout: Duration,
    pub completion_timeout: Duration,
    pub terminal_grace: Duration,
    pub session_retention: Duration,
    pub partial_recovery: bool,
}

impl OrchestratorSettings {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            public_url: config.public_url(),
            ready_timeout: config.ready_timeout(),
            completion_timeout: config.completion_timeout(),
            terminal_grace: config.terminal_grace(),
            session_retention: config.session_retention(),
            partial_recovery: config.runner.partial_recovery,
        }
    }
}

/// Drives each job from launch to teardown in its own background task.
pub struct Orchestrator {
    hub: Arc<RelayHub>,
    store: Arc<dyn JobStore>,
    runner: Arc<dyn TaskRunner>,
    publisher: Option<Arc<dyn RepositoryPublisher>>,
    settings: OrchestratorSettings,
    /// Launched tasks that have not been torn down yet.
    active: Mutex<HashMap<i64, TaskHandle>>,
}

impl Orchestrator {
    pub fn new(
        hub: Arc<RelayHub>,
        store: Arc<dyn JobStore>,
        runner: Arc<dyn TaskRunner>,
        publisher: Option<Arc<dyn RepositoryPublisher>>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            hub,
            store,
            runner,
            publisher,
            settings,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn hub(&self) -> &Arc<RelayHub> {
        &self.hub
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn relay_url(&self, job_id: i64) -> String {
        format!("{}/relay/worker/{}", self.settings.public_url, job_id)
    }

    /// Create a job record and start generating it.
    pub async fn submit(self: &Arc<Self>, new: NewJob) -> Result<Job> {
        let job = self.store.create_job(new).await?;
        self.start_generation(job.id, &job.owner_id, &job.instruction)
            .await?;
        // Re-read so the caller sees `generating`.
        Ok(self.store.get_job(job.id).await?.unwrap_or(job))
    }

    /// Mark the job `generating`, pre-register its relay session and spawn
    /// the lifecycle task. Returns once the status write is acknowledged.
    pub async fn start_generation(
        self: &Arc<Self>,
        job_id: i64,
        owner_id: &str,
        instruction: &str,
    ) -> Result<JoinHandle<()>> {
        self.store
            .update_job(job_id, JobUpdate::status(JobStatus::Generating))
            .await?;
        self.hub.register_session(job_id);

        let this = Arc::clone(self);
        let owner_id = owner_id.to_string();
        let instruction = instruction.to_string();
        tracing::info!(job_id, "Starting generation");
        Ok(tokio::spawn(async move {
            this.run_job(job_id, owner_id, instruction).await;
        }))
    }

    async fn run_job(&self, job_id: i64, owner_id: String, instruction: String) {
        let outcome = AssertUnwindSafe(self.drive(job_id, &owner_id, &instruction))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let failed = AssertUnwindSafe(self.fail(job_id, &owner_id, &instruction, e))
                    .catch_unwind()
                    .await;
                if failed.is_err() {
                    tracing::error!(job_id, "Failure handling panicked");
                }
            }
            Err(_) => {
                tracing::error!(job_id, "Orchestration task panicked");
                let e = RelayError::Other(anyhow::anyhow!("Orchestration task panicked"));
                let _ = AssertUnwindSafe(self.fail(job_id, &owner_id, &instruction, e))
                    .catch_unwind()
                    .await;
            }
        }

        self.finish(job_id).await;
    }

    async fn drive(&self, job_id: i64, owner_id: &str, instruction: &str) -> Result<(), RelayError> {
        let request = LaunchRequest {
            job_id,
            instruction: instruction.to_string(),
            relay_url: self.relay_url(job_id),
        };
        let handle = self
            .runner
            .launch(request)
            .await
            .map_err(|source| RelayError::LaunchFailed { job_id, source })?;
        self.active.lock().await.insert(job_id, handle.clone());

        self.hub
            .wait_for_ready(job_id, self.settings.ready_timeout)
            .await?;

        if !self.hub.send_command(job_id, instruction) {
            return Err(RelayError::CommandNotDelivered { job_id });
        }
        tracing::info!(job_id, "Instruction delivered to worker");

        let completion = self
            .hub
            .wait_for_completion(job_id, self.settings.completion_timeout)
            .await?;

        if completion.cancelled {
            // The hub already wrote the terminal status.
            tracing::info!(job_id, "Worker cancelled the job");
            self.hub.broadcast_to_observers(
                job_id,
                &ObserverEvent::status_change(job_id, JobStatus::Completed, None, completion.note),
            );
            return Ok(());
        }

        if !self
            .runner
            .poll_until_terminal(&handle, self.settings.terminal_grace)
            .await
        {
            tracing::warn!(job_id, "Worker still running after completion grace period");
        }

        let published = self
            .collect_and_publish(job_id, owner_id, instruction, &handle, false)
            .await;
        let output_location = published.or(completion.output_location);

        let job = self
            .store
            .update_job(job_id, JobUpdate::completed(output_location))
            .await?;
        tracing::info!(job_id, output_location = ?job.output_location, "Job completed");
        self.hub.broadcast_to_observers(
            job_id,
            &ObserverEvent::status_change(job_id, JobStatus::Completed, job.output_location, None),
        );
        Ok(())
    }

    /// Fetch the worker output and publish it. Every failure is non-fatal;
    /// `quiet` drops them to debug level.
    async fn collect_and_publish(
        &self,
        job_id: i64,
        owner_id: &str,
        instruction: &str,
        handle: &TaskHandle,
        quiet: bool,
    ) -> Option<String> {
        let source_dir = match self.runner.fetch_output(job_id, handle).await {
            Ok(dir) => dir,
            Err(e) => {
                if quiet {
                    tracing::debug!(job_id, error = %e, "No output to recover");
                } else {
                    tracing::warn!(job_id, error = %e, "Failed to fetch worker output");
                }
                return None;
            }
        };
        let publisher = self.publisher.as_ref()?;
        let request = PublishRequest {
            job_id,
            owner_id: owner_id.to_string(),
            instruction: instruction.to_string(),
            source_dir,
        };
        match publisher.publish(&request).await {
            Ok(url) => Some(url),
            Err(e) => {
                if quiet {
                    tracing::debug!(job_id, error = %e, "Partial publish failed");
                } else {
                    tracing::warn!(job_id, error = %e, "Failed to publish worker output");
                }
                None
            }
        }
    }

    /// Single failure path: one store write, one broadcast.
    async fn fail(&self, job_id: i64, owner_id: &str, instruction: &str, error: RelayError) {
        tracing::warn!(job_id, error = %error, "Generation failed");

        let handle = self.active.lock().await.get(&job_id).cloned();
        let mut partial = None;
        if let Some(handle) = &handle {
            let diagnostics = self.runner.fetch_diagnostics(handle).await;
            if !diagnostics.is_empty() {
                tracing::warn!(job_id, diagnostics = %diagnostics, "Worker diagnostics");
            }
            if error.is_completion_timeout() && self.settings.partial_recovery {
                partial = self
                    .collect_and_publish(job_id, owner_id, instruction, handle, true)
                    .await;
            }
        }

        let message = error.to_string();
        let update = JobUpdate {
            status: Some(JobStatus::Failed),
            error: Some(message.clone()),
            output_location: partial.clone(),
            ..Default::default()
        };
        match self.store.update_job(job_id, update).await {
            Ok(_) => {
                self.hub.broadcast_to_observers(
                    job_id,
                    &ObserverEvent::status_change(job_id, JobStatus::Failed, partial, Some(message)),
                );
            }
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Failed to record job failure");
            }
        }
    }

    /// Always runs: stop the task and schedule session cleanup.
    async fn finish(&self, job_id: i64) {
        let handle = self.active.lock().await.remove(&job_id);
        if let Some(handle) = handle {
            self.runner.terminate(&handle).await;
        }

        let hub = Arc::clone(&self.hub);
        let retention = self.settings.session_retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            hub.cleanup(job_id);
        });
    }

    pub async fn active_jobs(&self) -> Vec<i64> {
        self.active.lock().await.keys().copied().collect()
    }

    /// Terminate every active task and fail its job. Used on server shutdown.
    pub async fn shutdown(&self) {
        let handles: Vec<(i64, TaskHandle)> = self.active.lock().await.drain().collect();
        for (job_id, handle) in handles {
            tracing::info!(job_id, "Terminating worker on shutdown");
            self.runner.terminate(&handle).await;
            self.interrupt(job_id, SHUTDOWN_ERROR).await;
        }
    }

    /// Fail every job a previous process left in `pending`, `generating` or
    /// `paused`. Must run before the server accepts requests. Returns how
    /// many jobs were reconciled.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let jobs = self.store.list_unfinished_jobs().await?;
        let mut recovered = 0;
        for job in jobs {
            tracing::warn!(job_id = job.id, status = %job.status, "Job interrupted by restart");
            if self.interrupt(job.id, RESTART_ERROR).await {
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn interrupt(&self, job_id: i64, message: &str) -> bool {
        match self.store.update_job(job_id, JobUpdate::failed(message)).await {
            Ok(_) => {
                self.hub.broadcast_to_observers(
                    job_id,
                    &ObserverEvent::status_change(
                        job_id,
                        JobStatus::Failed,
                        None,
                        Some(message.to_string()),
                    ),
                );
                true
            }
            Err(e) => {
                tracing::debug!(job_id, error = %e, "Job already settled");
                false
            }
        }
    }
}
