use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Durable lifecycle state of a generation job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Generating,
    Paused,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Generating => "generating",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether a job may move from `self` to `next`.
    ///
    /// Terminal states accept no further status change. Re-asserting the
    /// current non-terminal status is allowed so repeated acknowledgements
    /// (e.g. two `resumed` events) are harmless.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (Self::Completed | Self::Failed, _) => false,
            (Self::Pending, Self::Paused) => false,
            (Self::Pending, _) => true,
            (Self::Generating | Self::Paused, Self::Pending) => false,
            (Self::Generating | Self::Paused, _) => true,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "generating" => Ok(Self::Generating),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: i64,
    pub owner_id: String,
    pub instruction: String,
    pub status: JobStatus,
    pub error: Option<String>,
    pub output_location: Option<String>,
    pub deployment_url: Option<String>,
    pub last_session_id: Option<String>,
    pub current_iteration: i64,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

/// Fields required to create a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub owner_id: String,
    pub instruction: String,
    pub session_id: Option<String>,
}

/// Partial update applied by `JobStore::update_job`. `None` leaves a field
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub error: Option<String>,
    pub output_location: Option<String>,
    pub deployment_url: Option<String>,
    pub last_session_id: Option<String>,
    pub current_iteration: Option<i64>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn completed(output_location: Option<String>) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            output_location,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    #[default]
    Automatic,
    Manual,
}

impl SnapshotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Manual => "manual",
        }
    }
}

impl FromStr for SnapshotKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "automatic" => Ok(Self::Automatic),
            "manual" => Ok(Self::Manual),
            _ => Err(format!("Invalid snapshot kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IterationSnapshot {
    pub id: i64,
    pub job_id: i64,
    pub iteration: i64,
    pub kind: SnapshotKind,
    pub file_state: serde_json::Value,
    pub instruction: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewSnapshot {
    pub job_id: i64,
    pub iteration: i64,
    pub kind: SnapshotKind,
    pub file_state: serde_json::Value,
    pub instruction: Option<String>,
    pub metadata: serde_json::Value,
}

/// In-memory status of a relay session. Distinct from `JobStatus`: it
/// tracks the worker connection, not the durable record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connecting,
    Ready,
    Generating,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Generating => "generating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authenticated caller, as returned by an `IdentityValidator`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_roundtrip_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Generating,
            JobStatus::Paused,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_terminal_states_reject_all_transitions() {
        for next in [
            JobStatus::Pending,
            JobStatus::Generating,
            JobStatus::Paused,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert!(!JobStatus::Completed.can_transition_to(next));
            assert!(!JobStatus::Failed.can_transition_to(next));
        }
    }

    #[test]
    fn test_generating_pause_resume_cycle() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Generating));
        assert!(JobStatus::Generating.can_transition_to(JobStatus::Paused));
        assert!(JobStatus::Paused.can_transition_to(JobStatus::Generating));
        assert!(JobStatus::Paused.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Generating.can_transition_to(JobStatus::Generating));
        assert!(!JobStatus::Generating.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Paused));
    }

    #[test]
    fn test_pending_can_fail_directly() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn test_job_status_serializes_snake_case() {
        let json = serde_json::to_string(&JobStatus::Generating).unwrap();
        assert_eq!(json, "\"generating\"");
    }

    #[test]
    fn test_snapshot_kind_default_is_automatic() {
        assert_eq!(SnapshotKind::default(), SnapshotKind::Automatic);
        assert_eq!("manual".parse::<SnapshotKind>().unwrap(), SnapshotKind::Manual);
    }

    #[test]
    fn test_session_status_terminal() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(!SessionStatus::Generating.is_terminal());
        assert_eq!(SessionStatus::Connecting.to_string(), "connecting");
    }
}
