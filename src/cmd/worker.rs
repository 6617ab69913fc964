//! Queue processing: `fixloop worker` and `fixloop run`.

use anyhow::Result;
use console::style;

use fixloop::pipeline::Outcome;
use fixloop::worker::{JobResult, Worker, run_pool};

use super::App;

fn print_job(result: &JobResult) {
    match result {
        JobResult::Idle => {}
        JobResult::Skipped { run_id } => {
            println!("Run {}: {}", run_id, style("skipped").dim());
        }
        JobResult::Canceled { run_id } => {
            println!("Run {}: {}", run_id, style("canceled").dim());
        }
        JobResult::Finished { run_id, outcome } => match outcome {
            Outcome::Completed => println!("Run {}: {}", run_id, style("completed").green().bold()),
            Outcome::WaitingApproval => {
                println!("Run {}: {}", run_id, style("waiting for approval").yellow());
                println!("  Review with `fixloop status {}`, then `fixloop decide {} yes`", run_id, run_id);
            }
            Outcome::Failed { reason } => {
                println!("Run {}: {} ({})", run_id, style("failed").red().bold(), reason);
                println!("  Inspect with `fixloop status {}`", run_id);
            }
        },
    }
}

pub async fn cmd_worker(app: &App, once: bool, concurrency: usize) -> Result<()> {
    if once {
        let worker = Worker::new(app.pipeline.clone());
        let results = worker.drain().await?;
        if results.is_empty() {
            println!("Queue is empty");
        }
        results.iter().for_each(print_job);
        return Ok(());
    }

    println!(
        "{} with {} worker(s), Ctrl+C to stop",
        style("Processing queue").bold().cyan(),
        concurrency.max(1)
    );
    tokio::select! {
        _ = run_pool(app.pipeline.clone(), concurrency) => {}
        _ = tokio::signal::ctrl_c() => {
            println!("{}", style("Stopping workers").yellow());
        }
    }
    Ok(())
}

pub async fn cmd_run(app: &App, id: i64) -> Result<()> {
    app.control.start(id).await?;
    let worker = Worker::new(app.pipeline.clone());
    for result in worker.drain().await? {
        print_job(&result);
    }
    Ok(())
}
