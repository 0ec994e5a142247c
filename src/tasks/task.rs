//! Task records
//!
//! A task is the authoritative record of one user-initiated request through
//! its lifecycle. Snapshots cross the bus as JSON objects.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Lifecycle status of a task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Voicing,
    Success,
    FailedOnGeneration,
    FailedOnVoiceover,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Voicing => "voicing",
            TaskStatus::Success => "success",
            TaskStatus::FailedOnGeneration => "failed_on_generation",
            TaskStatus::FailedOnVoiceover => "failed_on_voiceover",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Whether this status ends the request lifecycle
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Voicing)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for unrecognized status strings arriving over the bus
#[derive(Debug, thiserror::Error)]
#[error("unknown task status: {0}")]
pub struct UnknownTaskStatus(pub String);

impl FromStr for TaskStatus {
    type Err = UnknownTaskStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "voicing" => Ok(TaskStatus::Voicing),
            "success" => Ok(TaskStatus::Success),
            "failed_on_generation" => Ok(TaskStatus::FailedOnGeneration),
            "failed_on_voiceover" => Ok(TaskStatus::FailedOnVoiceover),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(UnknownTaskStatus(other.to_string())),
        }
    }
}

/// One user-initiated request and its artefacts
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    /// 128-bit random identifier
    pub uid: String,
    /// Category tag, e.g. "chat"
    #[serde(rename = "type")]
    pub task_type: String,
    pub status: TaskStatus,
    /// Input parameters snapshot
    #[serde(default)]
    pub data: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Result artefacts (`response` text, `voiceover_path`, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    /// Create a fresh PENDING task with a random uid
    pub fn new(task_type: impl Into<String>, data: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            uid: Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            status: TaskStatus::Pending,
            data,
            created_at: now,
            updated_at: now,
            result: None,
            error: None,
        }
    }

    /// Seconds elapsed since creation, by wall clock
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}
