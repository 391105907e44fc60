use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;

use super::api::{self, AppState, SharedState};
use super::bridge::SessionBridge;
use super::db::DbHandle;
use super::deploy::{DeploymentTrigger, WebhookDeployTrigger};
use super::docker::DockerTaskRunner;
use super::hub::RelayHub;
use super::identity;
use super::local::LocalProcessRunner;
use super::orchestrator::{Orchestrator, OrchestratorSettings};
use super::publisher::{GhCliPublisher, RepositoryPublisher};
use super::runner::TaskRunner;
use super::store::JobStore;
use super::ws;
use crate::config::{RelayConfig, RunnerKind};

/// Build the full application router: JSON API plus the three socket routes.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/relay/worker/{id}", get(ws::worker_handler))
        .route("/relay/observe/{id}", get(ws::observer_handler))
        .route("/relay/console", get(ws::console_handler))
        .with_state(state)
}

fn build_runner(config: &RelayConfig) -> Result<Arc<dyn TaskRunner>> {
    let work_dir = config.runner.work_dir.clone();
    Ok(match config.runner.kind {
        RunnerKind::Docker => Arc::new(
            DockerTaskRunner::new(config.runner.docker.clone(), work_dir)
                .context("Failed to initialize docker runner")?,
        ),
        RunnerKind::Local => Arc::new(LocalProcessRunner::new(
            config.runner.local.clone(),
            work_dir,
        )),
    })
}

/// Construct every external client once, from config.
pub fn build_state(config: &RelayConfig) -> Result<SharedState> {
    let db = DbHandle::open(&config.database.path).with_context(|| {
        format!(
            "Failed to open job database at {}",
            config.database.path.display()
        )
    })?;
    let store: Arc<dyn JobStore> = Arc::new(db);
    let hub = Arc::new(RelayHub::with_log_buffer(
        store.clone(),
        config.server.log_buffer,
    ));
    let runner = build_runner(config)?;

    let publisher: Option<Arc<dyn RepositoryPublisher>> = if config.publisher.enabled {
        Some(Arc::new(GhCliPublisher::new(config.publisher.clone())))
    } else {
        None
    };
    let deployer: Option<Arc<dyn DeploymentTrigger>> =
        config.deploy.webhook_url.as_ref().map(|url| {
            let token = config
                .deploy
                .token_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok());
            Arc::new(WebhookDeployTrigger::new(url.clone(), token)) as Arc<dyn DeploymentTrigger>
        });
    let identity = identity::from_config(&config.identity);

    let orchestrator = Arc::new(Orchestrator::new(
        hub.clone(),
        store.clone(),
        runner,
        publisher,
        OrchestratorSettings::from_config(config),
    ));
    let bridge = Arc::new(SessionBridge::new(orchestrator.clone(), identity.clone()));

    Ok(Arc::new(AppState {
        hub,
        store,
        orchestrator,
        bridge,
        identity,
        deployer,
    }))
}

/// Build the state and fail every job a previous process left unfinished.
pub async fn startup_state(config: &RelayConfig) -> Result<SharedState> {
    let state = build_state(config)?;
    let recovered = state
        .orchestrator
        .recover_interrupted()
        .await
        .context("Failed to reconcile interrupted jobs")?;
    if recovered > 0 {
        tracing::warn!(recovered, "Marked interrupted jobs failed");
    }
    Ok(state)
}

/// Start the relay server and block until ctrl-c.
pub async fn start_server(config: RelayConfig) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!(warning = %warning, "Config");
    }

    let state = startup_state(&config).await?;
    let orchestrator = state.orchestrator.clone();

    let mut app = build_router(state);
    if config.server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.server.dev_mode {
        "0.0.0.0"
    } else {
        config.server.host.as_str()
    };
    let addr = format!("{}:{}", host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(
        addr = %local_addr,
        public_url = %config.public_url(),
        runner = %config.runner.kind,
        "genforge relay listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    orchestrator.shutdown().await;
    tracing::info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalSection;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn local_config(dir: &std::path::Path) -> RelayConfig {
        let mut config = RelayConfig::default();
        config.database.path = dir.join("genforge.db");
        config.runner.kind = RunnerKind::Local;
        config.runner.work_dir = dir.join("work");
        config.runner.local = LocalSection {
            command: Some("true".into()),
            ..Default::default()
        };
        config
            .identity
            .tokens
            .insert("tok".into(), "user-1".into());
        config
    }

    #[tokio::test]
    async fn test_build_state_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let state = build_state(&local_config(dir.path())).unwrap();
        assert!(dir.path().join("genforge.db").exists());
        assert!(state.deployer.is_none());
        assert!(state.identity.validate("tok").await.is_some());
    }

    #[tokio::test]
    async fn test_deployer_built_when_webhook_configured() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = local_config(dir.path());
        config.deploy.webhook_url = Some("http://127.0.0.1:1/deploy".into());
        let state = build_state(&config).unwrap();
        assert!(state.deployer.is_some());
    }

    #[tokio::test]
    async fn test_startup_fails_jobs_left_generating() {
        use crate::relay::db::JobDb;
        use crate::relay::models::{JobStatus, JobUpdate, NewJob};
        use crate::relay::orchestrator::RESTART_ERROR;

        let dir = tempfile::tempdir().unwrap();
        let config = local_config(dir.path());
        let stale = {
            let db = JobDb::new(&config.database.path).unwrap();
            let job = db
                .create_job(&NewJob {
                    owner_id: "user-1".into(),
                    instruction: "build a todo app".into(),
                    session_id: None,
                })
                .unwrap();
            db.update_job(job.id, &JobUpdate::status(JobStatus::Generating))
                .unwrap()
        };

        let state = startup_state(&config).await.unwrap();
        let job = state.store.get_job(stale.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(RESTART_ERROR));
    }

    #[tokio::test]
    async fn test_router_serves_health_and_rejects_plain_socket_get() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(build_state(&local_config(dir.path())).unwrap());

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");

        // A GET without upgrade headers is not a valid WebSocket handshake.
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/relay/console")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }
}
