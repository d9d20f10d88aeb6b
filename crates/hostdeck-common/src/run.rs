use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// In-memory identifier of one deploy run. Never persisted.
pub type RunId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Done,
    Error,
}

/// Stable identifier of a catalog step.
///
/// The wire names follow the supervisor vocabulary the console already
/// speaks: registering a process is `pm2-start`, activating an existing one
/// is `pm2-restart` and persisting the process table is `pm2-save`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepId {
    #[serde(rename = "clone")]
    CloneRepo,
    #[serde(rename = "update")]
    Update,
    #[serde(rename = "install")]
    Install,
    #[serde(rename = "build")]
    Build,
    #[serde(rename = "pm2-start")]
    Register,
    #[serde(rename = "pm2-restart")]
    Activate,
    #[serde(rename = "pm2-save")]
    Persist,
}

impl StepId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CloneRepo => "clone",
            Self::Update => "update",
            Self::Install => "install",
            Self::Build => "build",
            Self::Register => "pm2-start",
            Self::Activate => "pm2-restart",
            Self::Persist => "pm2-save",
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One fragment of captured process output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub text: String,
}

impl OutputChunk {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            text: text.into(),
        }
    }

    pub fn is_stderr(&self) -> bool {
        self.stream == OutputStream::Stderr
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSnapshot {
    pub id: StepId,
    pub command: String,
    pub status: StepStatus,
    pub output: Vec<OutputChunk>,
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of a run, as served by the HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub slot: String,
    pub repo: String,
    pub branch: String,
    pub port: u16,
    pub status: RunStatus,
    pub steps: Vec<StepSnapshot>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
