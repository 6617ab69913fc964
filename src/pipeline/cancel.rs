//! Cooperative cancellation.
//!
//! Commands and model calls are never interrupted mid-flight; the pipeline
//! instead re-reads the run's status from the store at checkpoints between
//! steps and stops at the first one that observes `canceled`.

use crate::errors::RunError;
use crate::store::{DbHandle, Run, RunStatus};

#[derive(Clone)]
pub struct Checkpoint {
    db: DbHandle,
    run_id: i64,
}

impl Checkpoint {
    pub fn new(db: DbHandle, run_id: i64) -> Self {
        Self { db, run_id }
    }

    /// Fresh copy of the run from the store.
    pub async fn reload(&self) -> Result<Run, RunError> {
        self.db
            .run(self.run_id)
            .await
            .map_err(RunError::Store)?
            .ok_or(RunError::RunNotFound { id: self.run_id })
    }

    /// Fails with [`RunError::Canceled`] once the run has been canceled. The
    /// status is left as the canceller set it.
    pub async fn check(&self) -> Result<Run, RunError> {
        let run = self.reload().await?;
        if run.status == RunStatus::Canceled {
            tracing::info!(run_id = self.run_id, "cancellation observed");
            return Err(RunError::Canceled { run_id: self.run_id });
        }
        Ok(run)
    }
}
