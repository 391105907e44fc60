//! Wire types for the three socket protocols.
//!
//! - worker ↔ hub: `kind`-tagged, camelCase (`WorkerEvent`, `WorkerCommand`)
//! - hub → observer: `kind`-tagged, snake_case kinds with camelCase fields
//! - console client ↔ bridge: `type`-tagged, snake_case (`ConsoleRequest`, `ConsoleReply`)

use serde::{Deserialize, Serialize};

use super::models::{JobStatus, SnapshotKind};

// ── Worker → hub ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WorkerEvent {
    Log {
        message: String,
        #[serde(default)]
        level: Option<String>,
    },
    Progress {
        message: String,
        #[serde(default)]
        stage: Option<String>,
        #[serde(default)]
        percent: Option<f64>,
    },
    Ready {
        #[serde(default)]
        output_location: Option<String>,
    },
    IterationProgress {
        iteration: i64,
        #[serde(default)]
        file_state: Option<serde_json::Value>,
        #[serde(default)]
        instruction: Option<String>,
        #[serde(default)]
        metadata: Option<serde_json::Value>,
        #[serde(default)]
        snapshot_kind: Option<SnapshotKind>,
    },
    Paused {
        #[serde(default)]
        reason: Option<String>,
    },
    Resumed,
    Cancelled {
        #[serde(default)]
        reason: Option<String>,
    },
    Completed {
        #[serde(default)]
        output_location: Option<String>,
        #[serde(default)]
        summary: Option<String>,
    },
    Error {
        message: String,
    },
    #[serde(other)]
    Unknown,
}

impl WorkerEvent {
    /// Parse a text frame. Malformed frames yield `None`.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

/// Render a `progress` event as a single log line: `[stage] message (NN%)`.
pub fn format_progress(message: &str, stage: Option<&str>, percent: Option<f64>) -> String {
    let mut line = String::new();
    if let Some(stage) = stage {
        line.push_str(&format!("[{}] ", stage));
    }
    line.push_str(message);
    if let Some(percent) = percent {
        line.push_str(&format!(" ({:.0}%)", percent));
    }
    line
}

// ── Hub → worker ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WorkerCommand {
    Generate { job_id: i64, instruction: String },
}

// ── Hub → observer ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ObserverEvent {
    Log {
        job_id: i64,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        level: Option<String>,
        timestamp: String,
    },
    Status {
        job_id: i64,
        status: JobStatus,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        message: Option<String>,
        timestamp: String,
    },
    IterationProgress {
        job_id: i64,
        iteration: i64,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        instruction: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        metadata: Option<serde_json::Value>,
        timestamp: String,
    },
    StatusChange {
        job_id: i64,
        status: JobStatus,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        output_location: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<String>,
        timestamp: String,
    },
}

impl ObserverEvent {
    pub fn log(job_id: i64, message: impl Into<String>, level: Option<String>) -> Self {
        Self::Log {
            job_id,
            message: message.into(),
            level,
            timestamp: timestamp(),
        }
    }

    pub fn status(job_id: i64, status: JobStatus, message: Option<String>) -> Self {
        Self::Status {
            job_id,
            status,
            message,
            timestamp: timestamp(),
        }
    }

    pub fn status_change(
        job_id: i64,
        status: JobStatus,
        output_location: Option<String>,
        error: Option<String>,
    ) -> Self {
        Self::StatusChange {
            job_id,
            status,
            output_location,
            error,
            timestamp: timestamp(),
        }
    }
}

pub(crate) fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ── Console client ↔ bridge ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsoleRequest {
    Authenticate {
        token: String,
    },
    JoinSession {
        session_id: String,
    },
    LeaveSession,
    StartGeneration {
        #[serde(default)]
        session_id: Option<String>,
        instruction: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsoleReply {
    Authenticated { user_id: String },
    SessionJoined { session_id: String, job_id: i64 },
    SessionLeft { session_id: String },
    GenerationStarted { session_id: String, job_id: i64 },
    Error { message: String },
}

impl ConsoleReply {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Serialize an outbound message to a JSON text frame.
pub fn to_frame<T: Serialize>(msg: &T) -> Option<String> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize outbound message");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_worker_event_kinds_parse() {
        let e = WorkerEvent::parse(r#"{"kind":"log","message":"npm install"}"#).unwrap();
        assert_eq!(
            e,
            WorkerEvent::Log {
                message: "npm install".into(),
                level: None
            }
        );

        let e = WorkerEvent::parse(r#"{"kind":"ready","outputLocation":"/out"}"#).unwrap();
        assert_eq!(
            e,
            WorkerEvent::Ready {
                output_location: Some("/out".into())
            }
        );

        let e = WorkerEvent::parse(r#"{"kind":"resumed"}"#).unwrap();
        assert_eq!(e, WorkerEvent::Resumed);
    }

    #[test]
    fn test_iteration_progress_camel_case_fields() {
        let e = WorkerEvent::parse(
            r#"{"kind":"iterationProgress","iteration":2,"fileState":{"a.ts":"x"},"snapshotKind":"manual"}"#,
        )
        .unwrap();
        match e {
            WorkerEvent::IterationProgress {
                iteration,
                file_state,
                snapshot_kind,
                ..
            } => {
                assert_eq!(iteration, 2);
                assert_eq!(file_state, Some(json!({"a.ts": "x"})));
                assert_eq!(snapshot_kind, Some(SnapshotKind::Manual));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_and_malformed_frames() {
        assert_eq!(
            WorkerEvent::parse(r#"{"kind":"telemetry"}"#),
            Some(WorkerEvent::Unknown)
        );
        assert!(WorkerEvent::parse("not json").is_none());
        assert!(WorkerEvent::parse(r#"{"message":"no kind"}"#).is_none());
    }

    #[test]
    fn test_format_progress() {
        assert_eq!(
            format_progress("Installing", Some("deps"), Some(42.0)),
            "[deps] Installing (42%)"
        );
        assert_eq!(format_progress("Working", None, None), "Working");
    }

    #[test]
    fn test_generate_command_shape() {
        let cmd = WorkerCommand::Generate {
            job_id: 42,
            instruction: "build a todo app".into(),
        };
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(
            value,
            json!({"kind": "generate", "jobId": 42, "instruction": "build a todo app"})
        );
    }

    #[test]
    fn test_observer_status_change_shape() {
        let event = ObserverEvent::status_change(
            42,
            JobStatus::Completed,
            Some("https://github.com/acme/app".into()),
            None,
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "status_change");
        assert_eq!(value["jobId"], 42);
        assert_eq!(value["status"], "completed");
        assert_eq!(value["outputLocation"], "https://github.com/acme/app");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_observer_iteration_progress_kind() {
        let event = ObserverEvent::IterationProgress {
            job_id: 1,
            iteration: 3,
            instruction: None,
            metadata: Some(json!({"tokens": 10})),
            timestamp: timestamp(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "iteration_progress");
        assert_eq!(value["metadata"]["tokens"], 10);
    }

    #[test]
    fn test_console_request_parsing() {
        let req: ConsoleRequest =
            serde_json::from_str(r#"{"type":"join_session","session_id":"s-1"}"#).unwrap();
        assert_eq!(
            req,
            ConsoleRequest::JoinSession {
                session_id: "s-1".into()
            }
        );
        let req: ConsoleRequest =
            serde_json::from_str(r#"{"type":"start_generation","instruction":"hi"}"#).unwrap();
        assert_eq!(
            req,
            ConsoleRequest::StartGeneration {
                session_id: None,
                instruction: "hi".into()
            }
        );
        let req: ConsoleRequest = serde_json::from_str(r#"{"type":"dance"}"#).unwrap();
        assert_eq!(req, ConsoleRequest::Unknown);
    }

    #[test]
    fn test_console_reply_shape() {
        let value = serde_json::to_value(ConsoleReply::GenerationStarted {
            session_id: "s-1".into(),
            job_id: 9,
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"type": "generation_started", "session_id": "s-1", "job_id": 9})
        );
    }
}
