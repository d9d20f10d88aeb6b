use serde::{Deserialize, Serialize};

use crate::run::{OutputChunk, StepId};

/// One discrete transition of a deploy run, as pushed to observers.
///
/// Serialized as `{"type": "step-start", "data": {...}}`. Events carry only
/// plain data so the same value can be cloned to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum RunEvent {
    StepStart {
        step: StepId,
        command: String,
    },
    StepDone {
        step: StepId,
    },
    StepError {
        step: StepId,
    },
    Output {
        text: String,
        #[serde(rename = "isStderr")]
        is_stderr: bool,
    },
    /// Terminal event for the whole run.
    Done {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl RunEvent {
    pub fn output(chunk: &OutputChunk) -> Self {
        Self::Output {
            text: chunk.text.clone(),
            is_stderr: chunk.is_stderr(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}
