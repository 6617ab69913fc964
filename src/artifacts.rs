//! Per-run artifact files under `<artifact_root>/<run_id>/<name>`.
//!
//! Every write appends an artifact row, even when the file is overwritten,
//! so the store records each version in creation order.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::store::DbHandle;

#[derive(Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    db: DbHandle,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, db: DbHandle) -> Self {
        Self {
            root: root.into(),
            db,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: i64) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    pub fn path(&self, run_id: i64, name: &str) -> PathBuf {
        self.run_dir(run_id).join(name)
    }

    /// Write `content` to `name` and record it under `kind`.
    pub async fn write(&self, run_id: i64, name: &str, kind: &str, content: &str) -> Result<PathBuf> {
        let dir = self.run_dir(run_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create artifact dir {}", dir.display()))?;
        let path = dir.join(name);
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write artifact {}", path.display()))?;

        let kind = kind.to_string();
        let recorded = path.to_string_lossy().to_string();
        self.db
            .call(move |db| db.add_artifact(run_id, &kind, &recorded))
            .await?;
        tracing::debug!(run_id, artifact = name, "artifact written");
        Ok(path)
    }

    /// Contents of `name`, or `None` when it has not been written.
    pub fn read(&self, run_id: i64, name: &str) -> Option<String> {
        std::fs::read_to_string(self.path(run_id, name)).ok()
    }

    pub fn exists(&self, run_id: i64, name: &str) -> bool {
        self.path(run_id, name).is_file()
    }

    /// Best-effort removal of the run's artifact directory.
    pub fn remove_run(&self, run_id: i64) {
        let dir = self.run_dir(run_id);
        if dir.exists()
            && let Err(e) = std::fs::remove_dir_all(&dir)
        {
            tracing::warn!(run_id, error = %e, "failed to remove artifact dir");
        }
    }
}

/// File name of a recorded artifact path, for display.
pub fn file_name(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}
