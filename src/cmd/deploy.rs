//! One-shot deploy command: `hostdeck deploy`.
//!
//! Runs the pipeline in-process and prints its events on stdout. Ctrl+C
//! cancels the run; a second Ctrl+C is ignored until the run has stopped.

use std::io::Write;

use anyhow::{Context, Result, bail};
use console::style;

use hostdeck::common::{DeployRequest, RunEvent, RunStatus};
use hostdeck::config::HostdeckConfig;
use hostdeck::deploy::Orchestrator;

pub async fn cmd_deploy(
    config: HostdeckConfig,
    repo: &str,
    branch: &str,
    port: i64,
    name: Option<&str>,
    json: bool,
) -> Result<bool> {
    config.ensure_apps_root()?;
    let orchestrator = Orchestrator::new(config);

    let mut request = DeployRequest::new(repo, branch, port);
    if let Some(name) = name {
        request = request.with_name(name);
    }
    let run = match orchestrator.start(&request) {
        Ok(run) => run,
        Err(rejection) => bail!("Deploy rejected ({}): {}", rejection.code(), rejection),
    };

    if !json {
        println!(
            "{} {} {} {}",
            style("Deploying").bold(),
            style(run.slot()).cyan(),
            style(format!("({}@{})", repo, branch)).dim(),
            style(format!("run {}", run.id())).dim()
        );
    }

    let mut events = run.subscribe();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cancelled = false;

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(event) => print_event(&event, json)?,
                None => break,
            },
            _ = &mut ctrl_c, if !cancelled => {
                eprintln!("{}", style("Cancelling deploy...").yellow());
                run.cancel();
                cancelled = true;
            }
        }
    }

    let status = run.wait().await;
    Ok(status == RunStatus::Succeeded)
}

fn print_event(event: &RunEvent, json: bool) -> Result<()> {
    let mut out = std::io::stdout().lock();
    if json {
        let line = serde_json::to_string(event).context("Failed to serialize event")?;
        writeln!(out, "{}", line)?;
        return Ok(());
    }

    match event {
        RunEvent::StepStart { step, command } => {
            writeln!(out, "{} {}", style("▶").cyan(), style(step).bold())?;
            writeln!(out, "  {}", style(format!("$ {}", command)).dim())?;
        }
        RunEvent::Output { text, is_stderr } => {
            if *is_stderr {
                write!(out, "{}", style(text).yellow())?;
            } else {
                write!(out, "{}", text)?;
            }
        }
        RunEvent::StepDone { step } => {
            writeln!(out, "{} {}", style("✓").green(), step)?;
        }
        RunEvent::StepError { step } => {
            writeln!(out, "{} {}", style("✗").red(), step)?;
        }
        RunEvent::Done { success: true, .. } => {
            writeln!(out, "{}", style("Deploy succeeded").green().bold())?;
        }
        RunEvent::Done {
            success: false,
            error,
        } => {
            let reason = error.as_deref().unwrap_or("unknown error");
            writeln!(out, "{} {}", style("Deploy failed:").red().bold(), reason)?;
        }
    }
    out.flush()?;
    Ok(())
}
