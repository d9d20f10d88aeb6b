//! Per-run state and event publication.
//!
//! Every mutation of a [`Run`] and the broadcast of the matching event happen
//! under the same lock as [`Run::subscribe`], so a subscriber's replay and
//! its live stream never overlap or leave a gap. Events carry a per-run
//! sequence number; a subscriber that falls behind the broadcast buffer
//! resumes from recorded state at the first number it has not seen.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use hostdeck_common::{
    OutputChunk, RunEvent, RunId, RunSnapshot, RunStatus, StepId, StepSnapshot, StepStatus,
};

use crate::deploy::catalog::Step;
use crate::deploy::slot::RunSpec;
use crate::deploy::stream::{RunSubscription, Sequenced};

/// Capacity of the per-run broadcast buffer. A subscriber further behind
/// than this resumes from recorded state.
pub const EVENT_BUFFER: usize = 1024;

/// Stderr kept per step for failure messages.
const STDERR_TAIL_BYTES: usize = 2048;

#[derive(Debug)]
struct StepState {
    id: StepId,
    command: String,
    status: StepStatus,
    start_seq: u64,
    end_seq: u64,
    output: VecDeque<(u64, OutputChunk)>,
    output_bytes: usize,
    stderr_tail: String,
    exit_code: Option<i32>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl StepState {
    fn new(step: &Step) -> Self {
        Self {
            id: step.id,
            command: step.command.clone(),
            status: StepStatus::Pending,
            start_seq: 0,
            end_seq: 0,
            output: VecDeque::new(),
            output_bytes: 0,
            stderr_tail: String::new(),
            exit_code: None,
            started_at: None,
            finished_at: None,
        }
    }

    fn push_output(&mut self, seq: u64, chunk: OutputChunk, max_bytes: usize) {
        if chunk.is_stderr() {
            self.stderr_tail.push_str(&chunk.text);
            if self.stderr_tail.len() > STDERR_TAIL_BYTES {
                let mut cut = self.stderr_tail.len() - STDERR_TAIL_BYTES;
                while !self.stderr_tail.is_char_boundary(cut) {
                    cut += 1;
                }
                self.stderr_tail.drain(..cut);
            }
        }

        self.output_bytes += chunk.text.len();
        self.output.push_back((seq, chunk));
        while self.output_bytes > max_bytes && self.output.len() > 1 {
            if let Some((_, dropped)) = self.output.pop_front() {
                self.output_bytes -= dropped.text.len();
            }
        }
    }

    fn snapshot(&self) -> StepSnapshot {
        StepSnapshot {
            id: self.id,
            command: self.command.clone(),
            status: self.status,
            output: self.output.iter().map(|(_, chunk)| chunk.clone()).collect(),
            exit_code: self.exit_code,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

#[derive(Debug)]
struct RunState {
    status: RunStatus,
    steps: Vec<StepState>,
    error: Option<String>,
    finished_at: Option<DateTime<Utc>>,
    next_seq: u64,
    /// Assigned when the status turns terminal.
    done_seq: Option<u64>,
    done_published: bool,
}

impl RunState {
    fn done_event(&self) -> RunEvent {
        RunEvent::Done {
            success: self.status == RunStatus::Succeeded,
            error: self.error.clone(),
        }
    }

    /// Rebuild the events with sequence number `from` or later from the
    /// recorded state.
    ///
    /// Output is replayed from the retained (capped) record, so a step that
    /// dropped old fragments replays fewer `output` events than it published.
    fn replay_from(&self, from: u64) -> Vec<Sequenced> {
        let mut events = Vec::new();
        for step in &self.steps {
            if step.status == StepStatus::Pending {
                break;
            }
            events.push((
                step.start_seq,
                RunEvent::StepStart {
                    step: step.id,
                    command: step.command.clone(),
                },
            ));
            events.extend(
                step.output
                    .iter()
                    .map(|(seq, chunk)| (*seq, RunEvent::output(chunk))),
            );
            let end = match step.status {
                StepStatus::Done => RunEvent::StepDone { step: step.id },
                StepStatus::Error => RunEvent::StepError { step: step.id },
                StepStatus::Pending | StepStatus::Running => continue,
            };
            events.push((step.end_seq, end));
        }
        if let Some(seq) = self.done_seq {
            events.push((seq, self.done_event()));
        }
        events.retain(|(seq, _)| *seq >= from);
        events
    }
}

fn bump(counter: &mut u64) -> u64 {
    let seq = *counter;
    *counter += 1;
    seq
}

/// One execution of the step catalog against one slot.
#[derive(Debug)]
pub struct Run {
    id: RunId,
    slot: String,
    repo: String,
    branch: String,
    port: u16,
    created_at: DateTime<Utc>,
    max_output_bytes: usize,
    state: Mutex<RunState>,
    events: broadcast::Sender<Sequenced>,
    status: watch::Sender<RunStatus>,
    cancel: CancellationToken,
}

impl Run {
    pub fn new(id: RunId, spec: &RunSpec, steps: &[Step], max_output_bytes: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (status, _) = watch::channel(RunStatus::Running);
        Self {
            id,
            slot: spec.slot.clone(),
            repo: spec.repo.clone(),
            branch: spec.branch.clone(),
            port: spec.port,
            created_at: Utc::now(),
            max_output_bytes,
            state: Mutex::new(RunState {
                status: RunStatus::Running,
                steps: steps.iter().map(StepState::new).collect(),
                error: None,
                finished_at: None,
                next_seq: 0,
                done_seq: None,
                done_published: false,
            }),
            events,
            status,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, seq: u64, event: RunEvent) {
        // No receivers is fine: events are recoverable through replay.
        let _ = self.events.send((seq, event));
    }

    pub fn status(&self) -> RunStatus {
        self.lock().status
    }

    pub fn step_ids(&self) -> Vec<StepId> {
        self.lock().steps.iter().map(|s| s.id).collect()
    }

    pub fn start_step(&self, index: usize) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(step) = state.steps.get_mut(index) else {
            return;
        };
        step.status = StepStatus::Running;
        step.started_at = Some(Utc::now());
        step.start_seq = bump(&mut state.next_seq);
        let event = RunEvent::StepStart {
            step: step.id,
            command: step.command.clone(),
        };
        self.publish(step.start_seq, event);
    }

    pub fn append_output(&self, index: usize, chunk: OutputChunk) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(step) = state.steps.get_mut(index) else {
            return;
        };
        let seq = bump(&mut state.next_seq);
        let event = RunEvent::output(&chunk);
        step.push_output(seq, chunk, self.max_output_bytes);
        self.publish(seq, event);
    }

    pub fn finish_step(&self, index: usize, exit_code: i32, ok: bool) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(step) = state.steps.get_mut(index) else {
            return;
        };
        step.exit_code = Some(exit_code);
        step.finished_at = Some(Utc::now());
        step.end_seq = bump(&mut state.next_seq);
        let event = if ok {
            step.status = StepStatus::Done;
            RunEvent::StepDone { step: step.id }
        } else {
            step.status = StepStatus::Error;
            RunEvent::StepError { step: step.id }
        };
        self.publish(step.end_seq, event);
    }

    /// Trimmed stderr tail of a step, if it wrote any.
    pub fn stderr_tail(&self, index: usize) -> Option<String> {
        let state = self.lock();
        state
            .steps
            .get(index)
            .map(|s| s.stderr_tail.trim().to_string())
            .filter(|tail| !tail.is_empty())
    }

    /// Commit a terminal status. From here on the run reads as finished and
    /// replays end with `done`, but live subscribers and waiters are only
    /// told by [`Run::publish_done`]. Only the first call has any effect.
    pub fn set_terminal(&self, status: RunStatus, error: Option<String>) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.status.is_terminal() || !status.is_terminal() {
            return;
        }
        state.status = status;
        state.error = error;
        state.finished_at = Some(Utc::now());
        state.done_seq = Some(bump(&mut state.next_seq));
    }

    /// Broadcast `done` for the committed terminal status and wake waiters.
    pub fn publish_done(&self) {
        let mut state = self.lock();
        let Some(seq) = state.done_seq else {
            return;
        };
        if state.done_published {
            return;
        }
        state.done_published = true;
        self.publish(seq, state.done_event());
        self.status.send_replace(state.status);
    }

    fn snapshot_locked(&self, state: &RunState) -> RunSnapshot {
        RunSnapshot {
            run_id: self.id,
            slot: self.slot.clone(),
            repo: self.repo.clone(),
            branch: self.branch.clone(),
            port: self.port,
            status: state.status,
            steps: state.steps.iter().map(StepState::snapshot).collect(),
            error: state.error.clone(),
            created_at: self.created_at,
            finished_at: state.finished_at,
        }
    }

    pub fn snapshot(&self) -> RunSnapshot {
        let state = self.lock();
        self.snapshot_locked(&state)
    }

    /// Events equivalent to everything published so far.
    pub fn events_so_far(&self) -> Vec<RunEvent> {
        self.lock()
            .replay_from(0)
            .into_iter()
            .map(|(_, event)| event)
            .collect()
    }

    /// Replay of the run so far followed by live events.
    pub fn subscribe(self: &Arc<Self>) -> RunSubscription {
        let (replay, live) = self.resume_from(0);
        RunSubscription::new(self.clone(), replay, live)
    }

    /// Recorded events numbered `from` or later, and a receiver for every
    /// event published after them.
    pub(crate) fn resume_from(&self, from: u64) -> (Vec<Sequenced>, broadcast::Receiver<Sequenced>) {
        let state = self.lock();
        let replay = state.replay_from(from);
        let live = self.events.subscribe();
        drop(state);
        (replay, live)
    }

    /// Request cancellation of the in-flight step and every later one.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolve once `done` has been published.
    pub async fn wait(&self) -> RunStatus {
        let mut rx = self.status.subscribe();
        match rx.wait_for(|status| status.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        }
    }
}
