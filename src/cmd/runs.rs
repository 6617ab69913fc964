//! Commands that change a run's state.

use anyhow::{Context, Result};
use std::path::Path;

use fixloop::backends::PatcherMode;
use fixloop::pipeline::PipelineStep;

use super::App;

pub async fn cmd_create(
    app: &App,
    title: &str,
    ticket: Option<&str>,
    ticket_file: Option<&Path>,
    workspace: &Path,
) -> Result<()> {
    let ticket = match (ticket, ticket_file) {
        (Some(text), _) => text.to_string(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read ticket file {}", path.display()))?,
        (None, None) => anyhow::bail!("Provide --ticket or --ticket-file"),
    };
    if ticket.trim().is_empty() {
        anyhow::bail!("Ticket text is empty");
    }

    let run = app.control.create(title, &ticket, workspace).await?;
    println!("Created run {} ({})", console::style(run.id).bold(), run.title);
    println!("  workspace: {}", run.workspace);
    println!("Start it with `fixloop run {}`", run.id);
    Ok(())
}

pub async fn cmd_start(app: &App, id: i64) -> Result<()> {
    let run = app.control.start(id).await?;
    println!("Run {} is {}", run.id, run.status);
    Ok(())
}

pub async fn cmd_decide(app: &App, id: i64, decision: &str) -> Result<()> {
    let run = app.control.decide(id, decision).await?;
    println!(
        "Run {}: decision {}, status {}",
        run.id,
        console::style(run.patch_decision).bold(),
        run.status
    );
    if run.status.is_busy() {
        println!("Process it with `fixloop worker --once`");
    }
    Ok(())
}

pub async fn cmd_retry(app: &App, id: i64, from: Option<&str>, reset_sandbox: bool) -> Result<()> {
    let step = match from {
        Some(reference) => app.control.retry_step(id, reference, reset_sandbox).await?,
        None if reset_sandbox => {
            app.control
                .retry_step(id, PipelineStep::Preflight.name(), true)
                .await?
        }
        None => app.control.retry(id).await?,
    };
    println!("Run {} queued from step {}. {}", id, step.order(), step);
    Ok(())
}

pub async fn cmd_regenerate(app: &App, id: i64) -> Result<()> {
    app.control.regenerate(id).await?;
    println!("Run {} queued to regenerate its patch from a clean sandbox", id);
    Ok(())
}

pub async fn cmd_cancel(app: &App, id: i64) -> Result<()> {
    let run = app.control.cancel(id).await?;
    println!("Run {} is {}", run.id, run.status);
    Ok(())
}

pub async fn cmd_delete(app: &App, id: i64) -> Result<()> {
    if app.control.delete(id).await? {
        println!("Deleted run {}", id);
    } else {
        println!("Run {} not found", id);
    }
    Ok(())
}

pub async fn cmd_set_patcher(app: &App, id: i64, mode: &str) -> Result<()> {
    let mode: PatcherMode = mode.parse()?;
    app.control.set_patcher(id, mode).await?;
    println!("Run {} will use the {} patcher", id, console::style(mode).bold());
    Ok(())
}
