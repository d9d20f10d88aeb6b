//! Typed error hierarchy for hostdeck.
//!
//! - `Rejection` (re-exported from `hostdeck-common`): a deploy request was
//!   refused before any run was created
//! - `DeployError`: operations on existing runs (lookup, cancel)
//!
//! Step failures are not errors here: a non-zero exit is data recorded on the
//! run and reported through its terminal event.

use thiserror::Error;

pub use hostdeck_common::Rejection;
use hostdeck_common::{RunId, RunStatus};

/// Errors from the deploy orchestrator's control surface.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("Run {id} not found")]
    RunNotFound { id: RunId },

    #[error("Run {id} is not running (status: {status})")]
    NotRunning { id: RunId, status: RunStatus },
}
