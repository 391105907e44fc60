use std::io::Cursor;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, DownloadFromContainerOptionsBuilder, InspectContainerOptions,
    LogsOptionsBuilder, RemoveContainerOptionsBuilder, StartContainerOptions,
    StopContainerOptionsBuilder,
};
use futures::StreamExt;

use super::runner::{
    DIAGNOSTIC_LINES, LaunchRequest, TaskHandle, TaskRunner, job_dir, worker_env,
};
use crate::config::{DockerSection, parse_memory};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Runs each worker in its own Docker container.
pub struct DockerTaskRunner {
    docker: Docker,
    config: DockerSection,
    work_dir: PathBuf,
}

pub fn container_name(job_id: i64) -> String {
    format!("genforge-worker-{}", job_id)
}

impl DockerTaskRunner {
    pub fn new(config: DockerSection, work_dir: PathBuf) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker")?;
        Ok(Self {
            docker,
            config,
            work_dir,
        })
    }

    fn container_body(&self, request: &LaunchRequest) -> Result<ContainerCreateBody> {
        let image = self
            .config
            .image
            .clone()
            .context("runner.docker.image is not configured")?;

        let mut env: Vec<String> = worker_env(request, &self.config.output_dir)
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let mut extra: Vec<_> = self.config.env.iter().collect();
        extra.sort();
        env.extend(extra.into_iter().map(|(k, v)| format!("{}={}", k, v)));

        let host_config = HostConfig {
            memory: parse_memory(&self.config.memory),
            nano_cpus: Some((self.config.cpus * 1_000_000_000.0) as i64),
            extra_hosts: Some(vec!["host.docker.internal:host-gateway".to_string()]),
            ..Default::default()
        };

        Ok(ContainerCreateBody {
            image: Some(image),
            env: Some(env),
            host_config: Some(host_config),
            ..Default::default()
        })
    }

    async fn is_running(&self, container_id: &str) -> Result<bool> {
        let info = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .context("Failed to inspect container")?;
        Ok(info.state.and_then(|s| s.running).unwrap_or(false))
    }
}

#[async_trait]
impl TaskRunner for DockerTaskRunner {
    async fn launch(&self, request: LaunchRequest) -> Result<TaskHandle> {
        let job_id = request.job_id;
        let name = container_name(job_id);
        let body = self.container_body(&request)?;

        // A container left behind by an earlier attempt would block the name.
        let _ = self
            .docker
            .remove_container(
                &name,
                Some(RemoveContainerOptionsBuilder::default().force(true).build()),
            )
            .await;

        let options = CreateContainerOptionsBuilder::default().name(&name).build();
        let response = self
            .docker
            .create_container(Some(options), body)
            .await
            .with_context(|| format!("Failed to create container {}", name))?;
        let container_id = response.id;

        self.docker
            .start_container(&container_id, None::<StartContainerOptions>)
            .await
            .with_context(|| format!("Failed to start container {}", name))?;

        tracing::info!(
            job_id,
            container_id = %container_id,
            "Created and started worker container"
        );
        Ok(TaskHandle::Container {
            job_id,
            container_id,
        })
    }

    async fn poll_until_terminal(&self, handle: &TaskHandle, timeout: Duration) -> bool {
        let TaskHandle::Container { job_id, container_id } = handle else {
            return false;
        };
        let poll = async {
            loop {
                match self.is_running(container_id).await {
                    Ok(false) => return true,
                    Ok(true) => {}
                    Err(e) => {
                        tracing::debug!(job_id, error = %e, "Container inspect failed, treating as exited");
                        return true;
                    }
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.unwrap_or(false)
    }

    async fn fetch_output(&self, job_id: i64, handle: &TaskHandle) -> Result<PathBuf> {
        let TaskHandle::Container { container_id, .. } = handle else {
            anyhow::bail!("Docker runner cannot fetch output for a process handle");
        };
        let options = DownloadFromContainerOptionsBuilder::default()
            .path(&self.config.output_dir)
            .build();
        let mut stream = Box::pin(
            self.docker
                .download_from_container(container_id, Some(options)),
        );
        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Failed to download output archive")?;
            archive.extend_from_slice(&chunk);
        }

        let dest = job_dir(&self.work_dir, job_id).join("output");
        let unpack_dest = dest.clone();
        tokio::task::spawn_blocking(move || unpack_output(&archive, &unpack_dest))
            .await
            .context("Output unpack task panicked")??;

        tracing::info!(job_id, path = %dest.display(), "Fetched worker output");
        Ok(dest)
    }

    async fn terminate(&self, handle: &TaskHandle) {
        let TaskHandle::Container { job_id, container_id } = handle else {
            return;
        };

        if let Err(e) = self
            .docker
            .stop_container(
                container_id,
                Some(StopContainerOptionsBuilder::default().t(10).build()),
            )
            .await
        {
            tracing::warn!(job_id, error = %e, "Failed to stop container (may already be stopped)");
        }

        if let Err(e) = self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptionsBuilder::default().force(true).build()),
            )
            .await
        {
            tracing::warn!(job_id, error = %e, "Failed to remove container (may require manual cleanup)");
        }

        tracing::info!(job_id, "Stopped worker container");
    }

    async fn fetch_diagnostics(&self, handle: &TaskHandle) -> String {
        let TaskHandle::Container { container_id, .. } = handle else {
            return String::new();
        };
        let options = LogsOptionsBuilder::default()
            .stdout(true)
            .stderr(true)
            .tail(&DIAGNOSTIC_LINES.to_string())
            .build();
        let mut stream = Box::pin(self.docker.logs(container_id, Some(options)));
        let mut out = String::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(line) => out.push_str(&line.to_string()),
                Err(e) => {
                    out.push_str(&format!("<log stream error: {}>", e));
                    break;
                }
            }
        }
        out
    }
}

/// Unpack a `docker cp` archive into `dest`, dropping the archive's top-level
/// directory. Entries escaping `dest` are skipped.
pub fn unpack_output(archive: &[u8], dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create {}", dest.display()))?;
    let mut tar = tar::Archive::new(Cursor::new(archive));
    for entry in tar.entries().context("Failed to read output archive")? {
        let mut entry = entry.context("Corrupt entry in output archive")?;
        let path = entry.path().context("Invalid path in output archive")?.into_owned();
        let mut components = path.components();
        components.next();
        let relative: PathBuf = components.collect();
        if relative.as_os_str().is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            continue;
        }
        let target = dest.join(&relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        entry
            .unpack(&target)
            .with_context(|| format!("Failed to unpack {}", relative.display()))?;
    }
    Ok(())
}
