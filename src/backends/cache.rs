//! Process-owned cache of loaded model clients.

use anyhow::Result;
use mini_moka::sync::{Cache, ConcurrentCacheExt};
use std::sync::Arc;

use super::generative::ModelClient;

/// Identity of a loaded model.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelKey {
    pub model: String,
    pub adapter: Option<String>,
    pub device: String,
}

impl ModelKey {
    pub fn new(model: impl Into<String>, adapter: Option<&str>, device: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            adapter: adapter.map(str::trim).filter(|a| !a.is_empty()).map(str::to_string),
            device: device.into(),
        }
    }
}

impl std::fmt::Display for ModelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}::adapter={}::device={}",
            self.model,
            self.adapter.as_deref().unwrap_or("none"),
            self.device
        )
    }
}

/// Bounded cache of model clients. Eviction is handled by `mini_moka`.
pub struct ModelCache {
    entries: Cache<ModelKey, Arc<dyn ModelClient>>,
}

impl ModelCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Cache::builder().max_capacity(capacity.max(1) as u64).build(),
        }
    }

    /// Number of cached clients, after pending evictions have run.
    pub fn len(&self) -> usize {
        self.entries.sync();
        self.entries.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the cached client for `key`, or build it with `loader`.
    /// A failed load caches nothing.
    pub fn get_or_load<F>(&self, key: &ModelKey, loader: F) -> Result<Arc<dyn ModelClient>>
    where
        F: FnOnce() -> Result<Arc<dyn ModelClient>>,
    {
        if let Some(client) = self.entries.get(key) {
            return Ok(client);
        }
        let client = loader()?;
        tracing::info!(model = %key, "loaded model client");
        self.entries.insert(key.clone(), client.clone());
        Ok(client)
    }
}
