//! Typed error hierarchy for fixloop.
//!
//! Two top-level enums cover the two places errors cross a boundary:
//! - `RunError`: failures inside a run attempt (the pipeline and its components)
//! - `ControlError`: rejected run operations (start, decide, retry, ...)

use thiserror::Error;

/// Errors raised while driving a run through the pipeline.
///
/// Component errors are converted into a failed step at the owning step and
/// only then end the run. Anything that escapes a run attempt is wrapped as
/// `WorkerCrash` at the job boundary. Non-zero check exits are step
/// outcomes, not errors.
#[derive(Debug, Error)]
pub enum RunError {
    /// Preflight or baseline command could not run at all (missing tool).
    #[error("Environment error in {step}: {message}")]
    Environment { step: String, message: String },

    /// Diff failed structural/dry-run validation after every repair round.
    #[error("Invalid patch: {reason}")]
    PatchInvalid { reason: String },

    /// The patch tool rejected the diff at apply time.
    #[error("Patch apply failed: {diagnostic}")]
    ApplyFailure { diagnostic: String },

    /// Uncaught failure inside a run attempt, caught at the job boundary.
    #[error("Worker crashed while processing run {run_id}: {source}")]
    WorkerCrash {
        run_id: i64,
        #[source]
        source: anyhow::Error,
    },

    /// The run was canceled by the user; observed at a checkpoint.
    #[error("Run {run_id} canceled by user")]
    Canceled { run_id: i64 },

    #[error("Run {id} not found")]
    RunNotFound { id: i64 },

    /// Base workspace missing: fatal and not retried.
    #[error("Workspace not found: {path}")]
    WorkspaceNotFound { path: std::path::PathBuf },

    #[error("Store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from run operations invoked by the API layer or the CLI.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Run {id} not found")]
    RunNotFound { id: i64 },

    #[error("Run {id} is {status}; wait for it to finish or cancel it first")]
    RunBusy { id: i64, status: String },

    #[error("Run {id} is completed; its patch decision can no longer change")]
    DecisionLocked { id: i64 },

    #[error("Invalid patch decision '{value}'. Valid values: yes, no, rejected")]
    InvalidDecision { value: String },

    #[error("Unknown step '{reference}'")]
    UnknownStep { reference: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_error_environment_carries_step() {
        let err = RunError::Environment {
            step: "Baseline checks".into(),
            message: "pytest: command not found".into(),
        };
        assert_eq!(
            err.to_string(),
            "Environment error in Baseline checks: pytest: command not found"
        );
    }

    #[test]
    fn worker_crash_preserves_source() {
        use std::error::Error as _;
        let err = RunError::WorkerCrash {
            run_id: 7,
            source: anyhow::anyhow!("disk full"),
        };
        assert!(err.to_string().contains("run 7"));
        assert_eq!(err.source().map(|s| s.to_string()), Some("disk full".into()));
    }

    #[test]
    fn control_error_invalid_decision_lists_values() {
        let err = ControlError::InvalidDecision {
            value: "maybe".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("maybe"));
        assert!(msg.contains("yes, no, rejected"));
    }

    #[test]
    fn control_error_from_anyhow() {
        let err: ControlError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, ControlError::Other(_)));
    }
}
