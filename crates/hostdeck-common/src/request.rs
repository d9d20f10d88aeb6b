use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::run::RunId;

fn default_branch() -> String {
    "main".to_string()
}

/// Operator request to push a build live.
///
/// `port` is kept wide so that out-of-range values surface as an
/// `invalid-port` rejection instead of a decoding error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRequest {
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    pub port: i64,
    #[serde(rename = "pm2Name", default, skip_serializing_if = "Option::is_none")]
    pub pm2_name: Option<String>,
}

impl DeployRequest {
    pub fn new(repo: impl Into<String>, branch: impl Into<String>, port: i64) -> Self {
        Self {
            repo: repo.into(),
            branch: branch.into(),
            port,
            pm2_name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.pm2_name = Some(name.into());
        self
    }
}

/// Synchronous refusal to start a run. No run exists when one of these is
/// returned and no event has been emitted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("deployment slot '{slot}' is busy with run {run_id}")]
    SlotOccupied { slot: String, run_id: RunId },

    #[error("invalid process name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("invalid port {port}: expected a value between 1024 and 65535")]
    InvalidPort { port: i64 },

    #[error("invalid branch name '{branch}'")]
    InvalidBranch { branch: String },

    #[error("repository '{repo}' cannot be resolved: {reason}")]
    RepoUnresolvable { repo: String, reason: String },
}

impl Rejection {
    /// Stable machine-readable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SlotOccupied { .. } => "slot-occupied",
            Self::InvalidName { .. } => "invalid-name",
            Self::InvalidPort { .. } => "invalid-port",
            Self::InvalidBranch { .. } => "invalid-branch",
            Self::RepoUnresolvable { .. } => "repo-unresolvable",
        }
    }
}
