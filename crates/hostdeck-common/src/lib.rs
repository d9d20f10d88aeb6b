//! Shared wire and domain types for hostdeck.
//!
//! Everything in here is plain data: run and step statuses, the stable step
//! identifiers, the events pushed to observers of a deploy, and the request
//! and rejection types exchanged with the operator. The server, the CLI and
//! any browser client agree on these shapes.

pub mod event;
pub mod request;
pub mod run;

pub use event::RunEvent;
pub use request::{DeployRequest, Rejection};
pub use run::{
    OutputChunk, OutputStream, RunId, RunSnapshot, RunStatus, StepId, StepSnapshot, StepStatus,
};
