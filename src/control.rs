//! Run operations: what the CLI (or any API layer in front of it) calls to
//! create runs and steer them between pipeline attempts.
//!
//! Operations only touch the store, the queue, and the run's directories.
//! Processing always happens in a worker that dequeues the run.

use anyhow::Context;
use std::path::Path;

use crate::artifacts::ArtifactStore;
use crate::backends::PatcherMode;
use crate::errors::ControlError;
use crate::pipeline::{PATCHER_MODE_KEY, Pipeline, PipelineStep};
use crate::store::{Artifact, DbHandle, PatchDecision, Run, RunStatus, Step};
use crate::workspace::SandboxManager;

/// A run with its step records, as shown by `fixloop status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunSnapshot {
    pub run: Run,
    pub steps: Vec<Step>,
    pub patcher_override: Option<String>,
}

#[derive(Clone)]
pub struct RunControl {
    db: DbHandle,
    artifacts: ArtifactStore,
    sandboxes: SandboxManager,
}

impl RunControl {
    pub fn new(pipeline: &Pipeline) -> Self {
        Self {
            db: pipeline.db().clone(),
            artifacts: pipeline.artifacts().clone(),
            sandboxes: pipeline.sandboxes().clone(),
        }
    }

    pub async fn create(&self, title: &str, ticket: &str, workspace: &Path) -> Result<Run, ControlError> {
        if !workspace.is_dir() {
            return Err(anyhow::anyhow!("Workspace not found: {}", workspace.display()).into());
        }
        let workspace = workspace
            .canonicalize()
            .with_context(|| format!("Failed to resolve workspace {}", workspace.display()))?
            .to_string_lossy()
            .to_string();
        let (title, ticket) = (title.trim().to_string(), ticket.to_string());
        let run = self
            .db
            .call(move |db| db.create_run(&title, &ticket, &workspace))
            .await?;
        tracing::info!(run_id = run.id, workspace = %run.workspace, "run created");
        Ok(run)
    }

    async fn load(&self, id: i64) -> Result<Run, ControlError> {
        self.db.run(id).await?.ok_or(ControlError::RunNotFound { id })
    }

    /// Reject operations that would race a queued or running attempt.
    fn ensure_idle(run: &Run) -> Result<(), ControlError> {
        if run.status.is_busy() {
            return Err(ControlError::RunBusy {
                id: run.id,
                status: run.status.to_string(),
            });
        }
        Ok(())
    }

    async fn enqueue(&self, id: i64) -> Result<(), ControlError> {
        self.db
            .call(move |db| {
                db.set_run_status(id, RunStatus::Queued)?;
                db.enqueue(id)
            })
            .await?;
        tracing::info!(run_id = id, "run enqueued");
        Ok(())
    }

    pub async fn start(&self, id: i64) -> Result<Run, ControlError> {
        let run = self.load(id).await?;
        Self::ensure_idle(&run)?;
        self.db.set_decision(id, PatchDecision::No).await?;
        self.enqueue(id).await?;
        self.load(id).await
    }

    /// Record a patch decision. `yes` re-enqueues an idle run so it resumes
    /// at the apply step; a busy run picks the decision up at its gate.
    pub async fn decide(&self, id: i64, value: &str) -> Result<Run, ControlError> {
        let decision: PatchDecision = value.parse().map_err(|_| ControlError::InvalidDecision {
            value: value.to_string(),
        })?;
        let run = self.load(id).await?;
        if run.status == RunStatus::Completed {
            return Err(ControlError::DecisionLocked { id });
        }
        self.db.set_decision(id, decision).await?;
        tracing::info!(run_id = id, decision = %decision, "patch decision recorded");

        if !run.status.is_busy() {
            match decision {
                PatchDecision::Yes => self.enqueue(id).await?,
                PatchDecision::Rejected => self.db.set_status(id, RunStatus::Failed).await?,
                PatchDecision::No => self.db.set_status(id, RunStatus::WaitingApproval).await?,
            }
        }
        self.load(id).await
    }

    /// Reset the referenced step and everything after it, then re-enqueue.
    /// Resetting the gate or anything before it also withdraws approval.
    pub async fn retry_step(&self, id: i64, step_ref: &str, reset_sandbox: bool) -> Result<PipelineStep, ControlError> {
        let step = PipelineStep::from_ref(step_ref).ok_or_else(|| ControlError::UnknownStep {
            reference: step_ref.to_string(),
        })?;
        let run = self.load(id).await?;
        Self::ensure_idle(&run)?;

        let order = step.order();
        let reset = self.db.call(move |db| db.reset_steps_from(id, order)).await?;
        if order <= PipelineStep::Approval.order() {
            self.db.set_decision(id, PatchDecision::No).await?;
        }
        if reset_sandbox {
            let sandboxes = self.sandboxes.clone();
            let base = std::path::PathBuf::from(&run.workspace);
            tokio::task::spawn_blocking(move || sandboxes.reset(id, &base))
                .await
                .context("Sandbox reset task panicked")?
                .map_err(anyhow::Error::new)?;
        }
        tracing::info!(run_id = id, step = %step, reset, reset_sandbox, "steps reset for retry");
        self.enqueue(id).await?;
        Ok(step)
    }

    /// Propose a fresh patch from a clean sandbox.
    pub async fn regenerate(&self, id: i64) -> Result<PipelineStep, ControlError> {
        self.retry_step(id, PipelineStep::Propose.name(), true).await
    }

    /// Re-run every step.
    pub async fn retry(&self, id: i64) -> Result<PipelineStep, ControlError> {
        self.retry_step(id, PipelineStep::Preflight.name(), false).await
    }

    /// Cooperative: a running attempt stops at its next checkpoint.
    pub async fn cancel(&self, id: i64) -> Result<Run, ControlError> {
        let run = self.load(id).await?;
        if matches!(run.status, RunStatus::Completed | RunStatus::Canceled) {
            return Ok(run);
        }
        self.db.set_status(id, RunStatus::Canceled).await?;
        tracing::info!(run_id = id, "run canceled");
        self.load(id).await
    }

    /// Remove the run's rows, sandbox and artifacts. Returns false when the
    /// run did not exist.
    pub async fn delete(&self, id: i64) -> Result<bool, ControlError> {
        let removed = self.db.call(move |db| db.delete_run(id)).await?;
        if removed {
            self.sandboxes.cleanup(id);
            self.artifacts.remove_run(id);
            tracing::info!(run_id = id, "run deleted");
        }
        Ok(removed)
    }

    pub async fn set_patcher(&self, id: i64, mode: PatcherMode) -> Result<(), ControlError> {
        self.load(id).await?;
        let value = mode.as_str();
        self.db
            .call(move |db| db.kv_set(id, PATCHER_MODE_KEY, value))
            .await?;
        tracing::info!(run_id = id, patcher = %mode, "patcher override set");
        Ok(())
    }

    pub async fn status(&self, id: i64) -> Result<RunSnapshot, ControlError> {
        let run = self.load(id).await?;
        let (steps, patcher_override) = self
            .db
            .call(move |db| Ok((db.list_steps(id)?, db.kv_get(id, PATCHER_MODE_KEY)?)))
            .await?;
        Ok(RunSnapshot {
            run,
            steps,
            patcher_override,
        })
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<Run>, ControlError> {
        Ok(self.db.call(move |db| db.list_runs(limit)).await?)
    }

    pub async fn artifacts(&self, id: i64) -> Result<Vec<Artifact>, ControlError> {
        self.load(id).await?;
        Ok(self.db.call(move |db| db.list_artifacts(id)).await?)
    }
}
