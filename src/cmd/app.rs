//! Wiring shared by every command that touches runs.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use fixloop::backends::StandardBackends;
use fixloop::config::FixloopConfig;
use fixloop::control::RunControl;
use fixloop::pipeline::Pipeline;
use fixloop::store::DbHandle;

pub struct App {
    pub pipeline: Pipeline,
    pub control: RunControl,
}

impl App {
    /// Resolve configuration, anchor its relative paths at `cwd`, and open
    /// the run database.
    pub fn open(cwd: &Path, config_path: Option<&Path>) -> Result<Self> {
        let mut config = FixloopConfig::resolve(config_path, cwd)?;
        config.anchor_paths(cwd);
        let db = DbHandle::open(&config.paths.database).with_context(|| {
            format!("Failed to open run database {}", config.paths.database.display())
        })?;
        tracing::debug!(database = %config.paths.database.display(), mode = %config.patcher.mode, "configuration loaded");

        let backends = Arc::new(StandardBackends::new(config.clone()));
        let pipeline = Pipeline::new(Arc::new(config), db, backends);
        let control = RunControl::new(&pipeline);
        Ok(Self { pipeline, control })
    }
}
