//! Persistence for runs, steps, artifacts, run-scoped values and the queue.

pub mod db;
pub mod models;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

pub use db::RunDb;
pub use models::{Artifact, PatchDecision, Run, RunStatus, Step, StepStatus};

/// Async-safe handle to the run database.
///
/// Wraps `RunDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<RunDb>>,
}

impl DbHandle {
    pub fn new(db: RunDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(RunDb::new(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(RunDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&RunDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    pub async fn run(&self, id: i64) -> Result<Option<Run>> {
        self.call(move |db| db.get_run(id)).await
    }

    pub async fn steps(&self, run_id: i64) -> Result<Vec<Step>> {
        self.call(move |db| db.list_steps(run_id)).await
    }

    pub async fn set_status(&self, run_id: i64, status: RunStatus) -> Result<()> {
        self.call(move |db| db.set_run_status(run_id, status)).await
    }

    /// See [`RunDb::advance_run_status`].
    pub async fn advance_status(&self, run_id: i64, status: RunStatus) -> Result<bool> {
        self.call(move |db| db.advance_run_status(run_id, status)).await
    }

    pub async fn set_decision(&self, run_id: i64, decision: PatchDecision) -> Result<()> {
        self.call(move |db| db.set_patch_decision(run_id, decision)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_round_trip() {
        let handle = DbHandle::in_memory().unwrap();
        let run = handle
            .call(|db| db.create_run("t", "ticket", "/ws"))
            .await
            .unwrap();
        handle.set_status(run.id, RunStatus::Queued).await.unwrap();
        let loaded = handle.run(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Queued);
    }

    #[tokio::test]
    async fn test_open_creates_parent_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/fixloop.db");
        DbHandle::open(&path).unwrap();
        assert!(path.exists());
    }
}
