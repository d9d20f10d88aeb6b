//! Test doubles shared by the deploy module tests.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hostdeck_common::{OutputChunk, RunId, StepId};

use crate::config::HostdeckConfig;
use crate::deploy::catalog::Step;
use crate::deploy::run::Run;
use crate::deploy::runner::{CommandRunner, CommandSpec, ExitResult, Termination};
use crate::deploy::slot::{Checkout, Manifest, RunSpec};

/// A fresh-checkout run of `clone` then `build`, driven by hand.
pub(crate) fn scripted_run(max_output_bytes: usize) -> Arc<Run> {
    let spec = RunSpec {
        slot: "demo-app".to_string(),
        repo: "acme/demo-app".to_string(),
        repo_name: "demo-app".to_string(),
        clone_url: "https://github.com/acme/demo-app.git".to_string(),
        branch: "main".to_string(),
        port: 3050,
        working_dir: PathBuf::from("/srv/apps/demo-app"),
        checkout: Checkout::Fresh,
        manifest: Manifest::Unknown,
    };
    let steps = [StepId::CloneRepo, StepId::Build]
        .into_iter()
        .map(|id| Step {
            id,
            command: format!("run {}", id),
            working_dir: PathBuf::from("/srv/apps"),
            timeout: Duration::from_secs(5),
        })
        .collect::<Vec<_>>();
    Arc::new(Run::new(RunId::new_v4(), &spec, &steps, max_output_bytes))
}

/// Scripted runner: echoes each command, fakes `git clone` by creating the
/// target checkout with a manifest, and lets tests override selected
/// commands by substring.
#[derive(Default)]
pub(crate) struct FakeRunner {
    /// `(command fragment, result, stderr)` overrides, first match wins.
    pub outcomes: Vec<(&'static str, ExitResult, &'static str)>,
    /// Block commands containing this fragment until cancelled.
    pub hang_on: Option<&'static str>,
    pub panic_on: Option<&'static str>,
    /// Print this many numbered stdout lines for commands containing the
    /// fragment.
    pub chatter: Option<(&'static str, usize)>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeRunner {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Config rooted at `apps_root` that resolves bare repo names.
    pub fn config(apps_root: &Path) -> HostdeckConfig {
        let mut config = HostdeckConfig::default();
        config.deploy.apps_root = apps_root.to_path_buf();
        config.deploy.default_owner = Some("acme".to_string());
        config
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        chunks: mpsc::Sender<OutputChunk>,
        cancel: CancellationToken,
    ) -> ExitResult {
        self.calls.lock().unwrap().push(spec.command.clone());
        chunks
            .send(OutputChunk::stdout(format!("$ {}\n", spec.command)))
            .await
            .unwrap();

        if self.panic_on.is_some_and(|f| spec.command.contains(f)) {
            panic!("scripted panic");
        }
        if let Some((fragment, lines)) = self.chatter {
            if spec.command.contains(fragment) {
                for line in 0..lines {
                    chunks
                        .send(OutputChunk::stdout(format!("line {}\n", line)))
                        .await
                        .unwrap();
                }
            }
        }
        if self.hang_on.is_some_and(|f| spec.command.contains(f)) {
            cancel.cancelled().await;
            return ExitResult::synthetic(Termination::Cancelled);
        }
        for (fragment, result, stderr) in &self.outcomes {
            if spec.command.contains(fragment) {
                if !stderr.is_empty() {
                    chunks.send(OutputChunk::stderr(*stderr)).await.unwrap();
                }
                return result.clone();
            }
        }
        if spec.command.contains("git clone") {
            let target = spec.command.rsplit(' ').next().unwrap();
            let dir = spec.working_dir.join(target);
            std::fs::create_dir_all(dir.join(".git")).unwrap();
            std::fs::write(dir.join("package.json"), "{}").unwrap();
        }
        ExitResult::exited(0)
    }
}
