//! Read-only views of runs.

use anyhow::Result;
use console::{StyledObject, style};

use fixloop::artifacts::file_name;
use fixloop::store::{RunStatus, StepStatus};

use super::App;

fn styled_run_status(status: RunStatus) -> StyledObject<&'static str> {
    let s = style(status.as_str());
    match status {
        RunStatus::Completed => s.green(),
        RunStatus::Failed => s.red(),
        RunStatus::Canceled => s.dim(),
        RunStatus::WaitingApproval => s.yellow(),
        RunStatus::Queued | RunStatus::Running => s.cyan(),
        RunStatus::Created => s,
    }
}

fn styled_step_status(status: StepStatus) -> StyledObject<&'static str> {
    let s = style(status.as_str());
    match status {
        StepStatus::Success => s.green(),
        StepStatus::Failed => s.red(),
        StepStatus::Waiting => s.yellow(),
        StepStatus::Running => s.cyan(),
        StepStatus::Skipped | StepStatus::Pending => s.dim(),
    }
}

pub async fn cmd_list(app: &App, limit: usize) -> Result<()> {
    let runs = app.control.list(limit).await?;
    if runs.is_empty() {
        println!("No runs yet. Create one with `fixloop create`.");
        return Ok(());
    }
    println!("{:<6} {:<18} {:<9} Title", "Id", "Status", "Decision");
    println!("{:<6} {:<18} {:<9} -----", "------", "------------------", "---------");
    for run in &runs {
        println!(
            "{:<6} {:<18} {:<9} {}",
            run.id,
            styled_run_status(run.status),
            run.patch_decision,
            run.title
        );
    }
    Ok(())
}

pub async fn cmd_status(app: &App, id: i64, json: bool) -> Result<()> {
    let snapshot = app.control.status(id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    let run = &snapshot.run;
    println!();
    println!("{} {}", style(format!("Run {}:", run.id)).bold(), run.title);
    println!("  status:    {}", styled_run_status(run.status));
    println!("  decision:  {}", run.patch_decision);
    println!("  workspace: {}", run.workspace);
    if let Some(mode) = &snapshot.patcher_override {
        println!("  patcher:   {}", mode);
    }
    println!("  updated:   {}", run.updated_at);
    println!();

    for step in &snapshot.steps {
        println!(
            "  {:>2}. {:<22} {}",
            step.order,
            step.name,
            styled_step_status(step.status)
        );
        if !step.summary.is_empty() {
            println!("      {}", style(&step.summary).dim());
        }
        if !step.error.is_empty() {
            println!("      {} {}", style("Error:").red().bold(), step.error);
        }
        if !step.log_path.is_empty() {
            println!("      log: {}", file_name(&step.log_path));
        }
    }
    println!();

    if run.status == RunStatus::WaitingApproval {
        println!(
            "Review the proposal with `fixloop artifacts {}`, then `fixloop decide {} yes`.",
            run.id, run.id
        );
    }
    Ok(())
}

pub async fn cmd_artifacts(app: &App, id: i64) -> Result<()> {
    let artifacts = app.control.artifacts(id).await?;
    if artifacts.is_empty() {
        println!("Run {} has no artifacts yet", id);
        return Ok(());
    }
    for artifact in &artifacts {
        println!(
            "{:<18} {:<22} {}",
            style(&artifact.kind).cyan(),
            file_name(&artifact.path),
            artifact.path
        );
    }
    Ok(())
}
