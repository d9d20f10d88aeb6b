//! Deploy pipeline: turns an operator request into a live supervised process.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │ Console  │ ───────> │  server.rs  (axum Router, ServerOptions)         │
//! │ / CLI    │ <─────── │    ├─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│    └─ ws.rs   (event streaming, ping/pong)       │
//!                       │         │                                        │
//!                       │         │ Orchestrator::start(request)           │
//!                       │         v                                        │
//!                       │  pipeline.rs  (Orchestrator, run registry)       │
//!                       │         │                                        │
//!                       │         │ SlotResolver::resolve() → RunSpec      │
//!                       │         │ plan_steps() → Vec<Step>               │
//!                       │         │                                        │
//!                       │         │ CommandRunner::run() per step          │
//!                       │         v                                        │
//!                       │  runner.rs  (ShellRunner: sh -c, process group)  │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module    | Responsibility                                              |
//! |-----------|-------------------------------------------------------------|
//! | `slot`    | Request validation, slot keys, `SlotTable` + `SlotGuard`    |
//! | `catalog` | Fixed step catalog; the only place that builds shell lines  |
//! | `run`     | Per-run state, output retention, event publication          |
//! | `stream`  | Replay synthesis and `RunSubscription`                      |
//!
//! ## Run Lifecycle
//!
//! 1. `POST /api/deploy` (or the first frame on `/api/deploy/stream`)
//!    → `Orchestrator::start()`.
//! 2. The resolver validates the request and inspects `apps_root/<slot>`:
//!    an existing working copy means `update` + `pm2-restart`, otherwise
//!    `clone` + `pm2-start`. A held slot is rejected with `slot-occupied`.
//! 3. The slot is claimed, the run registered, and a background task walks
//!    the steps in order, publishing `step-start`, `output`, and
//!    `step-done` / `step-error`.
//! 4. The first failing step stops the run. The slot guard is dropped, then
//!    the terminal `done` event goes out.

pub mod api;
pub mod catalog;
pub mod pipeline;
pub mod run;
pub mod runner;
pub mod server;
pub mod slot;
pub mod stream;
pub mod ws;

#[cfg(test)]
pub(crate) mod testing;

pub use pipeline::Orchestrator;
pub use run::Run;
pub use stream::RunSubscription;
