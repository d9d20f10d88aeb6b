use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use hostdeck_common::{DeployRequest, Rejection, RunId, RunStatus};

use crate::config::HostdeckConfig;
use crate::deploy::catalog::{Step, plan_steps};
use crate::deploy::run::Run;
use crate::deploy::runner::{CommandRunner, CommandSpec, ShellRunner, Termination};
use crate::deploy::slot::{SlotGuard, SlotResolver, SlotTable};
use crate::errors::DeployError;

/// Error text of a run stopped by an operator.
pub const ABORTED: &str = "aborted";

const CHUNK_BUFFER: usize = 256;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

/// In-memory index of runs. Running runs are never evicted; finished runs
/// beyond `retained` are dropped oldest first.
#[derive(Debug)]
struct RunRegistry {
    runs: Vec<Arc<Run>>,
    retained: usize,
}

impl RunRegistry {
    fn insert(&mut self, run: Arc<Run>) {
        self.runs.push(run);
        let finished = self.runs.iter().filter(|r| r.status().is_terminal()).count();
        let mut excess = finished.saturating_sub(self.retained);
        self.runs.retain(|r| {
            if excess > 0 && r.status().is_terminal() {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }

    fn get(&self, id: RunId) -> Option<Arc<Run>> {
        self.runs.iter().find(|r| r.id() == id).cloned()
    }
}

/// Starts deploy runs and tracks them until they are evicted.
pub struct Orchestrator {
    config: Arc<HostdeckConfig>,
    resolver: SlotResolver,
    slots: SlotTable,
    runs: Mutex<RunRegistry>,
    runner: Arc<dyn CommandRunner>,
}

impl Orchestrator {
    pub fn new(config: HostdeckConfig) -> Self {
        Self::with_runner(config, Arc::new(ShellRunner::new()))
    }

    pub fn with_runner(config: HostdeckConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let resolver = SlotResolver::new(&config.deploy);
        let retained = config.deploy.retained_runs;
        Self {
            config: Arc::new(config),
            resolver,
            slots: SlotTable::new(),
            runs: Mutex::new(RunRegistry {
                runs: Vec::new(),
                retained,
            }),
            runner,
        }
    }

    pub fn config(&self) -> &HostdeckConfig {
        &self.config
    }

    fn registry(&self) -> MutexGuard<'_, RunRegistry> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validate the request, claim its slot and start the run in the
    /// background. Must be called from within a tokio runtime.
    ///
    /// Returning `Ok` only means the run started; its outcome is the
    /// terminal `done` event.
    pub fn start(&self, request: &DeployRequest) -> Result<Arc<Run>, Rejection> {
        let spec = self.resolver.resolve(request, &self.slots).inspect_err(|rejection| {
            info!(repo = %request.repo, code = rejection.code(), "deploy rejected: {}", rejection);
        })?;

        let run_id = RunId::new_v4();
        let guard = self.slots.acquire(&spec.slot, run_id).inspect_err(|rejection| {
            info!(slot = %spec.slot, code = rejection.code(), "deploy rejected: {}", rejection);
        })?;

        let steps = plan_steps(&spec, &self.config);
        let run = Arc::new(Run::new(
            run_id,
            &spec,
            &steps,
            self.config.deploy.max_output_bytes,
        ));
        self.registry().insert(run.clone());

        info!(
            run_id = %run_id,
            slot = %spec.slot,
            repo = %spec.repo,
            branch = %spec.branch,
            port = spec.port,
            checkout = ?spec.checkout,
            steps = steps.len(),
            "deploy run started"
        );

        tokio::spawn(execute(run.clone(), steps, guard, self.runner.clone()));
        Ok(run)
    }

    pub fn get(&self, id: RunId) -> Option<Arc<Run>> {
        self.registry().get(id)
    }

    /// Known runs, newest first.
    pub fn list(&self) -> Vec<Arc<Run>> {
        let mut runs = self.registry().runs.clone();
        runs.reverse();
        runs
    }

    pub fn active_slots(&self) -> Vec<(String, RunId)> {
        self.slots.active()
    }

    /// Request an abort. The run reaches `aborted` asynchronously.
    pub fn cancel(&self, id: RunId) -> Result<Arc<Run>, DeployError> {
        let run = self.get(id).ok_or(DeployError::RunNotFound { id })?;
        let status = run.status();
        if status.is_terminal() {
            return Err(DeployError::NotRunning { id, status });
        }
        info!(run_id = %id, slot = %run.slot(), "cancelling deploy run");
        run.cancel();
        Ok(run)
    }

    /// Cancel every running run and wait for them to finish.
    pub async fn shutdown(&self) {
        let running: Vec<_> = self
            .list()
            .into_iter()
            .filter(|r| !r.status().is_terminal())
            .collect();
        if running.is_empty() {
            return;
        }
        info!(count = running.len(), "shutting down: cancelling active deploy runs");
        for run in &running {
            run.cancel();
        }
        let all = futures_util::future::join_all(running.iter().map(|r| r.wait()));
        if tokio::time::timeout(SHUTDOWN_GRACE, all).await.is_err() {
            warn!("deploy runs did not stop within {}s", SHUTDOWN_GRACE.as_secs());
        }
    }
}

async fn execute(run: Arc<Run>, steps: Vec<Step>, slot: SlotGuard, runner: Arc<dyn CommandRunner>) {
    let (status, error) = AssertUnwindSafe(run_steps(&run, &steps, runner.as_ref()))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            error!(run_id = %run.id(), slot = %run.slot(), "deploy task panicked");
            (RunStatus::Failed, Some("deploy task panicked".to_string()))
        });

    info!(
        run_id = %run.id(),
        slot = %run.slot(),
        status = %status,
        error = error.as_deref().unwrap_or(""),
        "deploy run finished"
    );

    // The slot is free only once the run reads as finished, and before
    // `done` goes out so observers can redeploy at once.
    run.set_terminal(status, error);
    drop(slot);
    run.publish_done();
}

async fn run_steps(
    run: &Run,
    steps: &[Step],
    runner: &dyn CommandRunner,
) -> (RunStatus, Option<String>) {
    for (index, step) in steps.iter().enumerate() {
        if run.is_cancelled() {
            return (RunStatus::Aborted, Some(ABORTED.to_string()));
        }

        run.start_step(index);
        info!(run_id = %run.id(), slot = %run.slot(), step = %step.id, command = %step.command, "step started");

        let spec = CommandSpec {
            command: step.command.clone(),
            working_dir: step.working_dir.clone(),
            timeout: step.timeout,
        };
        let (tx, mut rx) = mpsc::channel(CHUNK_BUFFER);
        let forward = async {
            while let Some(chunk) = rx.recv().await {
                run.append_output(index, chunk);
            }
        };
        let (result, ()) = tokio::join!(runner.run(&spec, tx, run.cancel_token()), forward);

        if result.success() {
            run.finish_step(index, result.exit_code, true);
            info!(run_id = %run.id(), step = %step.id, exit_code = result.exit_code, "step done");
            continue;
        }

        run.finish_step(index, result.exit_code, false);
        warn!(
            run_id = %run.id(),
            slot = %run.slot(),
            step = %step.id,
            exit_code = result.exit_code,
            termination = ?result.termination,
            "step failed"
        );

        if result.termination == Termination::Cancelled || run.is_cancelled() {
            return (RunStatus::Aborted, Some(ABORTED.to_string()));
        }
        let reason = match result.termination {
            Termination::TimedOut => format!(
                "step `{}` timed out after {}s",
                step.id,
                step.timeout.as_secs()
            ),
            Termination::SpawnFailed(e) => format!("step `{}` could not start: {}", step.id, e),
            Termination::Exited | Termination::Cancelled => {
                run.stderr_tail(index).unwrap_or_else(|| {
                    format!("step `{}` exited with code {}", step.id, result.exit_code)
                })
            }
        };
        return (RunStatus::Failed, Some(reason));
    }
    (RunStatus::Succeeded, None)
}
