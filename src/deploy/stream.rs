//! Progress stream: an observer's ordered view of one run.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use hostdeck_common::RunEvent;

use crate::deploy::run::Run;

/// An event tagged with its position in the run's event order.
pub(crate) type Sequenced = (u64, RunEvent);

/// An observer's view of one run: the replay first, then live events, ending
/// after `done`.
///
/// A subscription that falls further behind than the broadcast buffer
/// resumes from the run's recorded state, so it never skips a step
/// transition or `done`. Only output fragments the run has already dropped
/// from its capped record can be missed.
#[derive(Debug)]
pub struct RunSubscription {
    run: Arc<Run>,
    replay: VecDeque<Sequenced>,
    live: broadcast::Receiver<Sequenced>,
    next_seq: u64,
    finished: bool,
}

impl RunSubscription {
    pub(crate) fn new(
        run: Arc<Run>,
        replay: Vec<Sequenced>,
        live: broadcast::Receiver<Sequenced>,
    ) -> Self {
        Self {
            run,
            replay: replay.into(),
            live,
            next_seq: 0,
            finished: false,
        }
    }

    /// Next event, or `None` once the run is over.
    pub async fn next(&mut self) -> Option<RunEvent> {
        loop {
            if let Some((seq, event)) = self.replay.pop_front() {
                return Some(self.deliver(seq, event));
            }
            if self.finished {
                return None;
            }
            match self.live.recv().await {
                Ok((seq, event)) if seq >= self.next_seq => return Some(self.deliver(seq, event)),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(
                        run_id = %self.run.id(),
                        skipped,
                        resume_at = self.next_seq,
                        "subscriber fell behind; resuming from recorded state"
                    );
                    let (replay, live) = self.run.resume_from(self.next_seq);
                    self.replay = replay.into();
                    self.live = live;
                }
                Err(RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    fn deliver(&mut self, seq: u64, event: RunEvent) -> RunEvent {
        self.next_seq = seq + 1;
        self.finished |= event.is_terminal();
        event
    }

    /// Drain the subscription to completion.
    pub async fn collect(mut self) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}
