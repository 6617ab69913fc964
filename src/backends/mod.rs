//! Patch backends: interchangeable proposal generators with a shared
//! propose/apply contract.
//!
//! - `rules`: offline, deterministic source transformations
//! - `ollama`: a local Ollama model behind the patch validator
//! - `hf`: a text-generation-inference server hosting a fine-tuned model

pub mod cache;
pub mod generative;
pub mod ollama;
pub mod rules;
pub mod tgi;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::config::FixloopConfig;
use crate::patch::PatchProposal;
pub use cache::{ModelCache, ModelKey};
pub use generative::{GenerativeBackend, ModelClient};
pub use ollama::OllamaClient;
pub use rules::RulesBackend;
pub use tgi::TgiClient;

/// Which backend proposes patches for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatcherMode {
    #[default]
    Rules,
    Ollama,
    Hf,
}

impl PatcherMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatcherMode::Rules => "rules",
            PatcherMode::Ollama => "ollama",
            PatcherMode::Hf => "hf",
        }
    }

    /// Model-backed modes; their proposals go through the validator and
    /// may fall back to rules.
    pub fn is_generative(&self) -> bool {
        !matches!(self, PatcherMode::Rules)
    }

    /// Lenient parse used for per-run overrides: unknown values mean rules.
    pub fn parse_or_rules(value: &str) -> Self {
        value.parse().unwrap_or_else(|_| {
            tracing::warn!(value, "unknown patcher mode, using rules");
            PatcherMode::Rules
        })
    }
}

impl std::fmt::Display for PatcherMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PatcherMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "rules" => Ok(PatcherMode::Rules),
            "ollama" => Ok(PatcherMode::Ollama),
            "hf" => Ok(PatcherMode::Hf),
            other => anyhow::bail!("Unknown patcher mode '{}' (expected rules, ollama or hf)", other),
        }
    }
}

/// Everything a backend needs to propose a patch.
#[derive(Debug, Clone, Default)]
pub struct ProposalRequest {
    pub ticket: String,
    pub signals: String,
    pub context: String,
    pub previous_diff: Option<String>,
    pub previous_error: Option<String>,
}

/// Propose a patch against a sandbox, then apply an accepted proposal to
/// the same sandbox.
#[async_trait]
pub trait PatchBackend: Send + Sync {
    fn mode(&self) -> PatcherMode;

    /// Must leave the sandbox unchanged.
    async fn propose(&self, req: &ProposalRequest) -> Result<PatchProposal>;

    /// Returns the applied proposal's title.
    async fn apply(&self, proposal: &PatchProposal) -> Result<String>;
}

/// Constructs backends bound to a sandbox. The pipeline builds through this
/// so tests can substitute scripted backends.
pub trait BackendFactory: Send + Sync {
    fn build(&self, mode: PatcherMode, sandbox: &Path) -> Result<Box<dyn PatchBackend>>;

    /// Client used for the optional model-written plan, if any.
    fn plan_client(&self, mode: PatcherMode) -> Option<Arc<dyn ModelClient>>;
}

/// Backends configured from `fixloop.toml`, sharing one model cache.
pub struct StandardBackends {
    config: FixloopConfig,
    cache: Arc<ModelCache>,
}

impl StandardBackends {
    pub fn new(config: FixloopConfig) -> Self {
        let cache = Arc::new(ModelCache::new(config.hf.cache_capacity));
        Self { config, cache }
    }

    fn client(&self, mode: PatcherMode) -> Result<Arc<dyn ModelClient>> {
        match mode {
            PatcherMode::Ollama => {
                let key = ModelKey::new(&self.config.ollama.model, None, "ollama");
                self.cache.get_or_load(&key, || {
                    Ok(Arc::new(OllamaClient::new(&self.config.ollama)?) as Arc<dyn ModelClient>)
                })
            }
            PatcherMode::Hf => {
                let hf = &self.config.hf;
                let key = ModelKey::new(&hf.model, Some(&hf.adapter), &hf.device);
                self.cache
                    .get_or_load(&key, || Ok(Arc::new(TgiClient::new(hf)?) as Arc<dyn ModelClient>))
            }
            PatcherMode::Rules => anyhow::bail!("rules mode has no model client"),
        }
    }
}

impl BackendFactory for StandardBackends {
    fn build(&self, mode: PatcherMode, sandbox: &Path) -> Result<Box<dyn PatchBackend>> {
        if !mode.is_generative() {
            return Ok(Box::new(RulesBackend::new(sandbox)));
        }
        Ok(Box::new(GenerativeBackend::new(
            mode,
            self.client(mode)?,
            sandbox,
            self.config.timeouts.apply_patch(),
            self.config.patcher.patch_max_attempts as usize,
        )))
    }

    fn plan_client(&self, mode: PatcherMode) -> Option<Arc<dyn ModelClient>> {
        if mode != PatcherMode::Ollama {
            return None;
        }
        match self.client(mode) {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::warn!(error = %e, "plan model unavailable");
                None
            }
        }
    }
}
