//! Typed error hierarchy for genforge.
//!
//! Two top-level enums cover the two seams callers match on:
//! - `RelayError`: session waits, command delivery and launch failures
//! - `StoreError`: job/snapshot invariants enforced by the job store

use thiserror::Error;

use crate::relay::models::JobStatus;

/// Errors from the relay hub and the orchestration flow.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("No relay session registered for job {job_id}")]
    SessionNotFound { job_id: i64 },

    #[error("Relay session for job {job_id} was closed while waiting")]
    SessionClosed { job_id: i64 },

    #[error("Worker for job {job_id} did not connect within {timeout_secs}s")]
    ReadyTimeout { job_id: i64, timeout_secs: u64 },

    #[error("Job {job_id} did not complete within {timeout_secs}s")]
    CompletionTimeout { job_id: i64, timeout_secs: u64 },

    #[error("{message}")]
    WorkerFailed { job_id: i64, message: String },

    #[error("Failed to deliver instruction to worker for job {job_id}")]
    CommandNotDelivered { job_id: i64 },

    #[error("Failed to launch worker for job {job_id}: {source}")]
    LaunchFailed {
        job_id: i64,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RelayError {
    /// True for the completion timeout, the only failure that triggers
    /// partial-output recovery.
    pub fn is_completion_timeout(&self) -> bool {
        matches!(self, RelayError::CompletionTimeout { .. })
    }
}

/// Errors from the job store that callers need to distinguish.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job {id} not found")]
    JobNotFound { id: i64 },

    #[error("Invalid status transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: i64,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Snapshot iteration {iteration} for job {job_id} is not greater than latest {latest}")]
    SnapshotOutOfOrder {
        job_id: i64,
        iteration: i64,
        latest: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_timeout_message_names_job_and_timeout() {
        let err = RelayError::ReadyTimeout {
            job_id: 7,
            timeout_secs: 60,
        };
        let msg = err.to_string();
        assert!(msg.contains("job 7"));
        assert!(msg.contains("60s"));
        assert!(!err.is_completion_timeout());
    }

    #[test]
    fn worker_failed_surfaces_message_verbatim() {
        let err = RelayError::WorkerFailed {
            job_id: 1,
            message: "npm install exploded".to_string(),
        };
        assert_eq!(err.to_string(), "npm install exploded");
    }

    #[test]
    fn completion_timeout_is_detected() {
        let err = RelayError::CompletionTimeout {
            job_id: 3,
            timeout_secs: 3600,
        };
        assert!(err.is_completion_timeout());
    }

    #[test]
    fn launch_failed_keeps_source() {
        let err = RelayError::LaunchFailed {
            job_id: 9,
            source: anyhow::anyhow!("docker daemon unavailable"),
        };
        assert!(err.to_string().contains("docker daemon unavailable"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn store_error_transition_names_states() {
        let err = StoreError::InvalidTransition {
            id: 5,
            from: JobStatus::Completed,
            to: JobStatus::Failed,
        };
        let msg = err.to_string();
        assert!(msg.contains("completed -> failed"), "got: {}", msg);
    }

    #[test]
    fn store_error_downcasts_through_anyhow() {
        let err: anyhow::Error = StoreError::SnapshotOutOfOrder {
            job_id: 1,
            iteration: 2,
            latest: 3,
        }
        .into();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::SnapshotOutOfOrder { latest: 3, .. })
        ));
    }
}
