//! Run pipeline: the fixed eleven-step state machine that drives a run
//! from preflight to report.
//!
//! Every entry into [`Pipeline::execute`] walks the full catalog. Steps that
//! already succeeded, were skipped, or are waiting are not re-executed; their
//! results are re-read from the artifacts they persisted. This one code path
//! serves first runs, resumption after a crash, retry-from-step and the
//! approval-gate resume.

pub mod cancel;
pub mod plan;
mod repair;
pub mod report;
mod steps;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::artifacts::ArtifactStore;
use crate::backends::{BackendFactory, PatcherMode};
use crate::config::FixloopConfig;
use crate::errors::RunError;
use crate::store::{DbHandle, RunStatus, Step};
use crate::workspace::{Directives, SandboxManager};

pub use cancel::Checkpoint;

/// The closed step catalog, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStep {
    Preflight,
    Baseline,
    Summarize,
    ContextSearch,
    Plan,
    Propose,
    Approval,
    Apply,
    PostChecks,
    Smoke,
    Report,
}

impl PipelineStep {
    pub const ALL: [PipelineStep; 11] = [
        Self::Preflight,
        Self::Baseline,
        Self::Summarize,
        Self::ContextSearch,
        Self::Plan,
        Self::Propose,
        Self::Approval,
        Self::Apply,
        Self::PostChecks,
        Self::Smoke,
        Self::Report,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Preflight => "Preflight",
            Self::Baseline => "Baseline checks",
            Self::Summarize => "Summarize issues",
            Self::ContextSearch => "Context search",
            Self::Plan => "Plan",
            Self::Propose => "Propose patch",
            Self::Approval => "Waiting for approval",
            Self::Apply => "Apply patch",
            Self::PostChecks => "Re-run checks",
            Self::Smoke => "Smoke test",
            Self::Report => "Report",
        }
    }

    /// 1-based position in the catalog.
    pub fn order(&self) -> i64 {
        Self::ALL
            .iter()
            .position(|s| s == self)
            .map(|i| i as i64 + 1)
            .unwrap_or(0)
    }

    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(|s| s.name()).collect()
    }

    /// Resolve a step by its order (`"6"`) or case-insensitive name.
    pub fn from_ref(reference: &str) -> Option<Self> {
        let r = reference.trim();
        if !r.is_empty() && r.chars().all(|c| c.is_ascii_digit()) {
            let order: usize = r.parse().ok()?;
            return order.checked_sub(1).and_then(|i| Self::ALL.get(i)).copied();
        }
        Self::ALL
            .iter()
            .find(|s| s.name().eq_ignore_ascii_case(r))
            .copied()
    }
}

impl std::fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// How a pipeline attempt ended. Errors are reserved for cancellation and
/// failures that escape every step boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// Dormant until a decision re-enqueues the run.
    WaitingApproval,
    Failed { reason: String },
}

impl Outcome {
    pub(crate) fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => f.write_str("Completed"),
            Self::WaitingApproval => f.write_str("Waiting for approval"),
            Self::Failed { reason } => f.write_str(reason),
        }
    }
}

/// Run-scoped KV key for the patcher override.
pub const PATCHER_MODE_KEY: &str = "patcher_mode";

/// Everything a pipeline attempt needs, shared across runs.
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<FixloopConfig>,
    db: DbHandle,
    artifacts: ArtifactStore,
    sandboxes: SandboxManager,
    backends: Arc<dyn BackendFactory>,
}

impl Pipeline {
    pub fn new(config: Arc<FixloopConfig>, db: DbHandle, backends: Arc<dyn BackendFactory>) -> Self {
        let artifacts = ArtifactStore::new(config.paths.artifacts_dir.clone(), db.clone());
        let sandboxes = SandboxManager::new(config.paths.sandbox_dir.clone())
            .with_isolation(config.paths.isolate_workspaces);
        Self {
            config,
            db,
            artifacts,
            sandboxes,
            backends,
        }
    }

    pub fn config(&self) -> &FixloopConfig {
        &self.config
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn sandboxes(&self) -> &SandboxManager {
        &self.sandboxes
    }

    /// Drive one attempt of `run_id` until it completes, fails, or parks at
    /// the approval gate.
    #[tracing::instrument(skip(self))]
    pub async fn execute(&self, run_id: i64) -> Result<Outcome, RunError> {
        let run = self
            .db
            .run(run_id)
            .await
            .map_err(RunError::Store)?
            .ok_or(RunError::RunNotFound { id: run_id })?;

        if run.status == RunStatus::Canceled {
            tracing::info!(run_id, "run is canceled, not starting an attempt");
            return Err(RunError::Canceled { run_id });
        }

        let steps = self.ensure_steps(run_id).await?;
        let started = self
            .db
            .advance_status(run_id, RunStatus::Running)
            .await
            .map_err(RunError::Store)?;
        if !started {
            return Err(RunError::Canceled { run_id });
        }

        let base = PathBuf::from(&run.workspace);
        let sandbox = match self.prepare_sandbox(run_id, &base).await {
            Ok(path) => path,
            Err(e) => return self.sandbox_failed(run_id, &steps, e).await,
        };

        let patcher = self.effective_patcher(run_id, &run.ticket).await?;
        tracing::info!(run_id, %patcher, sandbox = %sandbox.display(), "pipeline attempt started");

        let mut attempt = steps::Attempt::new(self, run, base, sandbox, patcher, steps);
        let outcome = attempt.drive().await?;
        tracing::info!(run_id, %outcome, "pipeline attempt finished");
        Ok(outcome)
    }

    async fn prepare_sandbox(&self, run_id: i64, base: &Path) -> Result<PathBuf, RunError> {
        let sandboxes = self.sandboxes.clone();
        let base = base.to_path_buf();
        tokio::task::spawn_blocking(move || sandboxes.ensure(run_id, &base))
            .await
            .map_err(|e| RunError::Other(anyhow::anyhow!("sandbox task panicked: {e}")))?
    }

    /// A sandbox that cannot be prepared fails the Preflight step.
    async fn sandbox_failed(&self, run_id: i64, steps: &[Step], e: RunError) -> Result<Outcome, RunError> {
        tracing::error!(run_id, error = %e, "sandbox setup failed");
        let message = e.to_string();
        if let Some(step) = steps.first() {
            let step_id = step.id;
            self.db
                .call(move |db| {
                    db.set_step_running(step_id)?;
                    db.set_step_failed(step_id, &message, "")
                })
                .await
                .map_err(RunError::Store)?;
        }
        let written = self
            .db
            .advance_status(run_id, RunStatus::Failed)
            .await
            .map_err(RunError::Store)?;
        if !written {
            return Err(RunError::Canceled { run_id });
        }
        Ok(Outcome::failed("Sandbox setup failed"))
    }

    /// The run's steps as the full canonical catalog, re-initialized
    /// wholesale when the stored set differs.
    async fn ensure_steps(&self, run_id: i64) -> Result<Vec<Step>, RunError> {
        self.db
            .call(move |db| {
                let existing = db.list_steps(run_id)?;
                let names: Vec<&str> = existing.iter().map(|s| s.name.as_str()).collect();
                if names == PipelineStep::names() {
                    return Ok(existing);
                }
                if !existing.is_empty() {
                    db.delete_steps(run_id)?;
                }
                db.init_steps(run_id, &PipelineStep::names())
            })
            .await
            .map_err(RunError::Store)
    }

    /// Run KV override, then ticket directive, then configuration. Unknown
    /// values mean rules.
    async fn effective_patcher(&self, run_id: i64, ticket: &str) -> Result<PatcherMode, RunError> {
        let stored = self
            .db
            .call(move |db| db.kv_get(run_id, PATCHER_MODE_KEY))
            .await
            .map_err(RunError::Store)?;
        let directives = Directives::parse(ticket);
        let requested = stored
            .filter(|v| !v.trim().is_empty())
            .or_else(|| directives.patcher().map(str::to_string));
        Ok(match requested {
            Some(value) => PatcherMode::parse_or_rules(&value),
            None => self.config.patcher.mode,
        })
    }
}
