//! Queue consumer.
//!
//! A worker pops one run id at a time, takes the run's lease, and drives one
//! pipeline attempt. The lease keeps two workers from processing the same
//! run concurrently; the job boundary turns anything that escapes the
//! pipeline into a `failed` run so it is never left `running`.

use anyhow::Result;
use std::time::Duration;

use crate::errors::RunError;
use crate::pipeline::{Outcome, Pipeline};
use crate::store::RunStatus;

/// What one `run_once` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// Queue was empty.
    Idle,
    /// Entry dropped: canceled, completed or deleted run, or another worker
    /// holds it.
    Skipped { run_id: i64 },
    Finished { run_id: i64, outcome: Outcome },
    Canceled { run_id: i64 },
}

#[derive(Clone)]
pub struct Worker {
    pipeline: Pipeline,
    owner: String,
    lease_secs: u64,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(pipeline: Pipeline) -> Self {
        let worker = &pipeline.config().worker;
        let lease_secs = worker.lease_secs.max(1);
        let poll_interval = Duration::from_millis(worker.poll_interval_ms.max(10));
        Self {
            owner: format!("worker-{}", uuid::Uuid::new_v4()),
            pipeline,
            lease_secs,
            poll_interval,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Process the next queue entry, if any.
    pub async fn run_once(&self) -> Result<JobResult, RunError> {
        let next = self
            .pipeline
            .db()
            .call(|db| db.dequeue())
            .await
            .map_err(RunError::Store)?;
        match next {
            Some(run_id) => self.process(run_id).await,
            None => Ok(JobResult::Idle),
        }
    }

    /// Process entries until the queue is empty.
    pub async fn drain(&self) -> Result<Vec<JobResult>, RunError> {
        let mut results = Vec::new();
        loop {
            match self.run_once().await? {
                JobResult::Idle => return Ok(results),
                other => results.push(other),
            }
        }
    }

    /// Poll forever. Crashes are logged and the loop keeps going.
    pub async fn run_forever(&self) {
        tracing::info!(owner = %self.owner, "worker started");
        loop {
            match self.run_once().await {
                Ok(JobResult::Idle) => tokio::time::sleep(self.poll_interval).await,
                Ok(result) => tracing::debug!(?result, "job done"),
                Err(e) => tracing::error!(owner = %self.owner, error = %e, "job crashed"),
            }
        }
    }

    async fn process(&self, run_id: i64) -> Result<JobResult, RunError> {
        let db = self.pipeline.db().clone();
        match db.run(run_id).await.map_err(RunError::Store)? {
            None => {
                tracing::warn!(run_id, "queued run no longer exists");
                return Ok(JobResult::Skipped { run_id });
            }
            Some(run) if matches!(run.status, RunStatus::Canceled | RunStatus::Completed) => {
                tracing::info!(run_id, status = %run.status, "stale queue entry, skipping");
                return Ok(JobResult::Skipped { run_id });
            }
            Some(_) => {}
        }

        let (owner, ttl) = (self.owner.clone(), self.lease_secs);
        let acquired = db
            .call(move |db| db.try_acquire_lease(run_id, &owner, ttl))
            .await
            .map_err(RunError::Store)?;
        if !acquired {
            tracing::info!(run_id, "run leased by another worker, skipping");
            return Ok(JobResult::Skipped { run_id });
        }

        let heartbeat = Heartbeat(self.spawn_heartbeat(run_id));
        let pipeline = self.pipeline.clone();
        let result = match tokio::spawn(async move { pipeline.execute(run_id).await }).await {
            Ok(result) => result,
            Err(e) => Err(RunError::Other(anyhow::anyhow!("run attempt panicked: {e}"))),
        };
        // Stop renewals before the lease is released.
        drop(heartbeat);

        let owner = self.owner.clone();
        if let Err(e) = db.call(move |db| db.release_lease(run_id, &owner)).await {
            tracing::warn!(run_id, error = %e, "failed to release lease");
        }

        match result {
            Ok(outcome) => Ok(JobResult::Finished { run_id, outcome }),
            Err(RunError::Canceled { .. }) => Ok(JobResult::Canceled { run_id }),
            Err(RunError::RunNotFound { .. }) => {
                tracing::warn!(run_id, "run deleted during processing");
                Ok(JobResult::Skipped { run_id })
            }
            Err(e) => {
                tracing::error!(run_id, error = %e, "run attempt crashed");
                match db.advance_status(run_id, RunStatus::Failed).await {
                    Ok(true) => {}
                    Ok(false) => tracing::info!(run_id, "crashed run was canceled, status left as is"),
                    Err(mark) => tracing::error!(run_id, error = %mark, "failed to mark crashed run failed"),
                }
                Err(RunError::WorkerCrash {
                    run_id,
                    source: anyhow::Error::new(e),
                })
            }
        }
    }

    /// Extend the lease while a long attempt is in flight. Stopped when the
    /// returned handle's [`Heartbeat`] guard drops.
    fn spawn_heartbeat(&self, run_id: i64) -> tokio::task::JoinHandle<()> {
        let db = self.pipeline.db().clone();
        let (owner, ttl) = (self.owner.clone(), self.lease_secs);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs((ttl / 3).max(1)));
            tick.tick().await;
            loop {
                tick.tick().await;
                let owner = owner.clone();
                if let Err(e) = db.call(move |db| db.try_acquire_lease(run_id, &owner, ttl)).await {
                    tracing::warn!(run_id, error = %e, "lease renewal failed");
                }
            }
        })
    }
}

/// Aborts the lease renewal task when dropped, including when the
/// `process` future itself is dropped mid-attempt.
struct Heartbeat(tokio::task::JoinHandle<()>);

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run `concurrency` workers against the shared queue until the process is
/// stopped.
pub async fn run_pool(pipeline: Pipeline, concurrency: usize) {
    let workers: Vec<_> = (0..concurrency.max(1))
        .map(|_| {
            let worker = Worker::new(pipeline.clone());
            tokio::spawn(async move { worker.run_forever().await })
        })
        .collect();
    for joined in futures::future::join_all(workers).await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "worker task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{BackendFactory, ModelClient, PatchBackend, PatcherMode, StandardBackends};
    use crate::config::FixloopConfig;
    use crate::store::DbHandle;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn pipeline(dir: &TempDir) -> Pipeline {
        let config = FixloopConfig::rooted_at(dir.path());
        Pipeline::new(
            Arc::new(config.clone()),
            DbHandle::in_memory().unwrap(),
            Arc::new(StandardBackends::new(config)),
        )
    }

    #[tokio::test]
    async fn test_empty_queue_is_idle() {
        let dir = TempDir::new().unwrap();
        let worker = Worker::new(pipeline(&dir));
        assert!(worker.owner().starts_with("worker-"));
        assert_eq!(worker.run_once().await.unwrap(), JobResult::Idle);
        assert!(worker.drain().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_skips_canceled_and_leased_runs() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir);
        let db = pipeline.db().clone();
        let worker = Worker::new(pipeline);

        let canceled = db.call(|db| db.create_run("a", "t", "/ws")).await.unwrap();
        db.set_status(canceled.id, RunStatus::Canceled).await.unwrap();
        let leased = db.call(|db| db.create_run("b", "t", "/ws")).await.unwrap();
        let (c, l) = (canceled.id, leased.id);
        db.call(move |db| {
            db.try_acquire_lease(l, "someone-else", 600)?;
            db.enqueue(c)?;
            db.enqueue(l)
        })
        .await
        .unwrap();

        let results = worker.drain().await.unwrap();
        assert_eq!(
            results,
            vec![JobResult::Skipped { run_id: c }, JobResult::Skipped { run_id: l }]
        );
    }

    #[tokio::test]
    async fn test_missing_workspace_fails_run_and_releases_lease() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir);
        let db = pipeline.db().clone();
        let worker = Worker::new(pipeline);

        let missing = dir.path().join("gone").to_string_lossy().to_string();
        let run = db
            .call(move |db| db.create_run("x", "t", &missing))
            .await
            .unwrap();
        let id = run.id;
        db.call(move |db| db.enqueue(id)).await.unwrap();

        let result = worker.run_once().await.unwrap();
        assert_eq!(
            result,
            JobResult::Finished {
                run_id: id,
                outcome: Outcome::failed("Sandbox setup failed"),
            }
        );
        assert_eq!(db.run(id).await.unwrap().unwrap().status, RunStatus::Failed);
        let steps = db.steps(id).await.unwrap();
        assert!(steps[0].error.contains("Workspace not found"), "{}", steps[0].error);

        // The lease was released.
        let reacquired = db
            .call(move |db| db.try_acquire_lease(id, "other", 60))
            .await
            .unwrap();
        assert!(reacquired);
    }

    struct PanickingBackends;

    impl BackendFactory for PanickingBackends {
        fn build(&self, _mode: PatcherMode, _sandbox: &Path) -> Result<Box<dyn PatchBackend>> {
            panic!("backend construction blew up");
        }

        fn plan_client(&self, _mode: PatcherMode) -> Option<Arc<dyn ModelClient>> {
            None
        }
    }

    #[tokio::test]
    async fn test_panicking_attempt_crashes_to_failed() {
        if std::process::Command::new("bash").arg("--version").output().is_err() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let ws = dir.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::write(
            ws.join(".fixloop.yml"),
            "name: red\ncommands:\n  preflight: \"true\"\n  baseline: \"exit 1\"\n",
        )
        .unwrap();
        let config = FixloopConfig::rooted_at(dir.path());
        let pipeline = Pipeline::new(
            Arc::new(config),
            DbHandle::in_memory().unwrap(),
            Arc::new(PanickingBackends),
        );
        let db = pipeline.db().clone();
        let worker = Worker::new(pipeline);

        let workspace = ws.to_string_lossy().to_string();
        let run = db
            .call(move |db| db.create_run("x", "Tidy up", &workspace))
            .await
            .unwrap();
        let id = run.id;
        db.call(move |db| db.enqueue(id)).await.unwrap();

        let err = worker.run_once().await.unwrap_err();
        assert!(matches!(err, RunError::WorkerCrash { run_id, .. } if run_id == id));
        assert_eq!(db.run(id).await.unwrap().unwrap().status, RunStatus::Failed);
        let reacquired = db
            .call(move |db| db.try_acquire_lease(id, "other", 60))
            .await
            .unwrap();
        assert!(reacquired);
    }
}
