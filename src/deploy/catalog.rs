//! The fixed step catalog.
//!
//! Each entry is a pure function of the resolved [`RunSpec`] and the
//! configuration that yields a [`Step`] or skips. This is the only module
//! that builds shell command lines.

use std::path::PathBuf;
use std::time::Duration;

use hostdeck_common::StepId;

use crate::config::HostdeckConfig;
use crate::deploy::slot::{Checkout, Manifest, RunSpec};

/// A concrete, ready-to-run step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub id: StepId,
    pub command: String,
    pub working_dir: PathBuf,
    pub timeout: Duration,
}

type CatalogEntry = fn(&RunSpec, &HostdeckConfig) -> Option<Step>;

const CATALOG: [CatalogEntry; 7] = [
    clone_step,
    update_step,
    install_step,
    build_step,
    register_step,
    activate_step,
    persist_step,
];

/// Walk the catalog in order and keep the steps that apply to this run.
pub fn plan_steps(spec: &RunSpec, config: &HostdeckConfig) -> Vec<Step> {
    CATALOG
        .iter()
        .filter_map(|entry| entry(spec, config))
        .collect()
}

/// Quote `value` for `sh` unless it only holds characters that need none.
pub fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '@' | '='));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

fn clone_step(spec: &RunSpec, config: &HostdeckConfig) -> Option<Step> {
    if !spec.checkout.needs_clone() {
        return None;
    }
    let parent = spec
        .working_dir
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| config.deploy.apps_root.clone());
    let slot = shell_quote(&spec.slot);
    let clone = format!(
        "git clone --branch {} --single-branch {} {}",
        shell_quote(&spec.branch),
        shell_quote(&spec.clone_url),
        slot
    );
    let command = if spec.checkout == Checkout::Stale {
        format!("rm -rf -- {} && {}", slot, clone)
    } else {
        clone
    };
    Some(Step {
        id: StepId::CloneRepo,
        command,
        working_dir: parent,
        timeout: config.timeouts.fetch(),
    })
}

fn update_step(spec: &RunSpec, config: &HostdeckConfig) -> Option<Step> {
    if spec.checkout != Checkout::Existing {
        return None;
    }
    // Single-branch clones only track their first branch, so check out
    // whatever the fetch brought in rather than a remote-tracking ref.
    Some(Step {
        id: StepId::Update,
        command: format!(
            "git fetch origin {b} && git checkout -B {b} FETCH_HEAD",
            b = shell_quote(&spec.branch)
        ),
        working_dir: spec.working_dir.clone(),
        timeout: config.timeouts.fetch(),
    })
}

fn install_step(spec: &RunSpec, config: &HostdeckConfig) -> Option<Step> {
    project_step(
        spec,
        StepId::Install,
        &config.steps.install_command,
        config.timeouts.install(),
    )
}

fn build_step(spec: &RunSpec, config: &HostdeckConfig) -> Option<Step> {
    project_step(
        spec,
        StepId::Build,
        &config.steps.build_command,
        config.timeouts.build(),
    )
}

fn project_step(spec: &RunSpec, id: StepId, command: &str, timeout: Duration) -> Option<Step> {
    let command = command.trim();
    if command.is_empty() || spec.manifest == Manifest::Absent {
        return None;
    }
    Some(Step {
        id,
        command: command.to_string(),
        working_dir: spec.working_dir.clone(),
        timeout,
    })
}

fn register_step(spec: &RunSpec, config: &HostdeckConfig) -> Option<Step> {
    if !spec.checkout.needs_clone() {
        return None;
    }
    let command = start_command(spec, config);
    Some(supervisor_step(spec, config, StepId::Register, command))
}

/// Restart the existing process, registering it when the supervisor does not
/// know it yet (an earlier deploy of this slot failed before registering).
fn activate_step(spec: &RunSpec, config: &HostdeckConfig) -> Option<Step> {
    if spec.checkout != Checkout::Existing {
        return None;
    }
    let command = format!(
        "PORT={} {} restart {} --update-env || {}",
        spec.port,
        config.supervisor.command.trim(),
        shell_quote(&spec.slot),
        start_command(spec, config)
    );
    Some(supervisor_step(spec, config, StepId::Activate, command))
}

fn start_command(spec: &RunSpec, config: &HostdeckConfig) -> String {
    let mut command = format!(
        "PORT={} {} start {} --name {}",
        spec.port,
        config.supervisor.command.trim(),
        config.steps.start_script.trim(),
        shell_quote(&spec.slot)
    );
    let args = config.steps.start_args.trim();
    if !args.is_empty() {
        command.push_str(" -- ");
        command.push_str(args);
    }
    command
}

fn persist_step(spec: &RunSpec, config: &HostdeckConfig) -> Option<Step> {
    let command = format!("{} save", config.supervisor.command.trim());
    Some(supervisor_step(spec, config, StepId::Persist, command))
}

fn supervisor_step(spec: &RunSpec, config: &HostdeckConfig, id: StepId, command: String) -> Step {
    Step {
        id,
        command,
        working_dir: spec.working_dir.clone(),
        timeout: config.timeouts.supervisor(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(checkout: Checkout, manifest: Manifest) -> RunSpec {
        RunSpec {
            slot: "demo-app".to_string(),
            repo: "acme/demo-app".to_string(),
            repo_name: "demo-app".to_string(),
            clone_url: "https://github.com/acme/demo-app.git".to_string(),
            branch: "main".to_string(),
            port: 3050,
            working_dir: PathBuf::from("/srv/apps/demo-app"),
            checkout,
            manifest,
        }
    }

    fn config() -> HostdeckConfig {
        let mut config = HostdeckConfig::default();
        config.deploy.apps_root = PathBuf::from("/srv/apps");
        config
    }

    fn ids(steps: &[Step]) -> Vec<StepId> {
        steps.iter().map(|s| s.id).collect()
    }

    #[test]
    fn test_fresh_checkout_plan() {
        let steps = plan_steps(&spec(Checkout::Fresh, Manifest::Unknown), &config());
        assert_eq!(
            ids(&steps),
            vec![
                StepId::CloneRepo,
                StepId::Install,
                StepId::Build,
                StepId::Register,
                StepId::Persist
            ]
        );
        assert_eq!(
            steps[0].command,
            "git clone --branch main --single-branch https://github.com/acme/demo-app.git demo-app"
        );
        assert_eq!(steps[0].working_dir, PathBuf::from("/srv/apps"));
        assert_eq!(
            steps[3].command,
            "PORT=3050 pm2 start npm --name demo-app -- start"
        );
        assert_eq!(steps[4].command, "pm2 save");
    }

    #[test]
    fn test_existing_checkout_plan() {
        let steps = plan_steps(&spec(Checkout::Existing, Manifest::Present), &config());
        assert_eq!(
            ids(&steps),
            vec![
                StepId::Update,
                StepId::Install,
                StepId::Build,
                StepId::Activate,
                StepId::Persist
            ]
        );
        assert_eq!(
            steps[0].command,
            "git fetch origin main && git checkout -B main FETCH_HEAD"
        );
        assert_eq!(
            steps[3].command,
            "PORT=3050 pm2 restart demo-app --update-env \
             || PORT=3050 pm2 start npm --name demo-app -- start"
        );
        assert!(
            steps
                .iter()
                .all(|s| s.working_dir == PathBuf::from("/srv/apps/demo-app"))
        );
    }

    #[test]
    fn test_update_checks_out_fetched_branch() {
        let mut spec = spec(Checkout::Existing, Manifest::Present);
        spec.branch = "release/2.x".to_string();
        let steps = plan_steps(&spec, &config());
        assert_eq!(
            steps[0].command,
            "git fetch origin release/2.x && git checkout -B release/2.x FETCH_HEAD"
        );
    }

    #[test]
    fn test_stale_checkout_is_removed_and_recloned() {
        let steps = plan_steps(&spec(Checkout::Stale, Manifest::Unknown), &config());
        assert_eq!(
            ids(&steps),
            vec![
                StepId::CloneRepo,
                StepId::Install,
                StepId::Build,
                StepId::Register,
                StepId::Persist
            ]
        );
        assert_eq!(
            steps[0].command,
            "rm -rf -- demo-app && git clone --branch main --single-branch \
             https://github.com/acme/demo-app.git demo-app"
        );
        assert_eq!(steps[0].working_dir, PathBuf::from("/srv/apps"));
    }

    #[test]
    fn test_register_and_activate_are_exclusive() {
        for checkout in [Checkout::Fresh, Checkout::Stale, Checkout::Existing] {
            let steps = plan_steps(&spec(checkout, Manifest::Present), &config());
            let supervisor: Vec<_> = ids(&steps)
                .into_iter()
                .filter(|id| matches!(id, StepId::Register | StepId::Activate))
                .collect();
            assert_eq!(supervisor.len(), 1);
        }
    }

    #[test]
    fn test_missing_manifest_skips_install_and_build() {
        let steps = plan_steps(&spec(Checkout::Existing, Manifest::Absent), &config());
        assert_eq!(
            ids(&steps),
            vec![StepId::Update, StepId::Activate, StepId::Persist]
        );
    }

    #[test]
    fn test_empty_commands_skip_steps() {
        let mut config = config();
        config.steps.build_command = "  ".to_string();
        let steps = plan_steps(&spec(Checkout::Fresh, Manifest::Unknown), &config);
        assert!(!ids(&steps).contains(&StepId::Build));
        assert!(ids(&steps).contains(&StepId::Install));
    }

    #[test]
    fn test_step_timeouts_follow_config() {
        let mut config = config();
        config.timeouts.fetch_secs = 5;
        config.timeouts.build_secs = 7;
        config.timeouts.supervisor_secs = 9;
        let steps = plan_steps(&spec(Checkout::Fresh, Manifest::Unknown), &config);
        assert_eq!(steps[0].timeout, Duration::from_secs(5));
        assert_eq!(steps[2].timeout, Duration::from_secs(7));
        assert_eq!(steps[4].timeout, Duration::from_secs(9));
    }

    #[test]
    fn test_custom_supervisor_and_empty_start_args() {
        let mut config = config();
        config.supervisor.command = "npx pm2".to_string();
        config.steps.start_script = "server.js".to_string();
        config.steps.start_args = String::new();
        let steps = plan_steps(&spec(Checkout::Fresh, Manifest::Unknown), &config);
        assert_eq!(
            steps[3].command,
            "PORT=3050 npx pm2 start server.js --name demo-app"
        );
        assert_eq!(steps[4].command, "npx pm2 save");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("main"), "main");
        assert_eq!(shell_quote("feature/x-1"), "feature/x-1");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
