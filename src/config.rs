//! Configuration for fixloop.
//!
//! Settings are read from `fixloop.toml` (or the path given with `--config`),
//! then environment variables override individual values. A `.env` file in
//! the working directory is loaded before the environment is consulted.
//!
//! # Configuration File Format
//!
//! ```toml
//! [paths]
//! database = ".fixloop/fixloop.db"
//! artifacts_dir = ".fixloop/artifacts"
//! sandbox_dir = ".fixloop/sandboxes"
//! isolate_workspaces = true
//!
//! [timeouts]
//! preflight_secs = 30
//! test_command_secs = 300
//! smoke_secs = 60
//! apply_patch_secs = 120
//!
//! [patcher]
//! mode = "rules"
//! patch_max_attempts = 2
//! max_patch_iterations = 2
//!
//! [ollama]
//! url = "http://localhost:11434"
//! model = "qwen2.5-coder:7b"
//!
//! [hf]
//! url = "http://localhost:8080"
//! model = "Qwen/Qwen2.5-Coder-0.5B-Instruct"
//! adapter = "my-lora"
//!
//! [context]
//! max_files = 8
//! max_chars = 12000
//!
//! [worker]
//! poll_interval_ms = 1000
//! lease_secs = 900
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backends::PatcherMode;

pub const CONFIG_FILE_NAME: &str = "fixloop.toml";

/// Filesystem locations for the store, artifacts and sandboxes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsSection {
    #[serde(default = "default_database")]
    pub database: PathBuf,
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,
    #[serde(default = "default_sandbox_dir")]
    pub sandbox_dir: PathBuf,
    /// When false the pipeline operates on the base workspace directly.
    #[serde(default = "default_true")]
    pub isolate_workspaces: bool,
}

fn default_database() -> PathBuf {
    PathBuf::from(".fixloop/fixloop.db")
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from(".fixloop/artifacts")
}

fn default_sandbox_dir() -> PathBuf {
    PathBuf::from(".fixloop/sandboxes")
}

fn default_true() -> bool {
    true
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            database: default_database(),
            artifacts_dir: default_artifacts_dir(),
            sandbox_dir: default_sandbox_dir(),
            isolate_workspaces: true,
        }
    }
}

/// Per-call timeouts for subprocesses, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsSection {
    #[serde(default = "default_preflight_secs")]
    pub preflight_secs: u64,
    #[serde(default = "default_test_command_secs")]
    pub test_command_secs: u64,
    #[serde(default = "default_smoke_secs")]
    pub smoke_secs: u64,
    #[serde(default = "default_apply_patch_secs")]
    pub apply_patch_secs: u64,
    #[serde(default = "default_max_command_secs")]
    pub max_command_secs: u64,
}

fn default_preflight_secs() -> u64 {
    30
}

fn default_test_command_secs() -> u64 {
    300
}

fn default_smoke_secs() -> u64 {
    60
}

fn default_apply_patch_secs() -> u64 {
    120
}

fn default_max_command_secs() -> u64 {
    300
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            preflight_secs: default_preflight_secs(),
            test_command_secs: default_test_command_secs(),
            smoke_secs: default_smoke_secs(),
            apply_patch_secs: default_apply_patch_secs(),
            max_command_secs: default_max_command_secs(),
        }
    }
}

impl TimeoutsSection {
    pub fn preflight(&self) -> Duration {
        Duration::from_secs(self.preflight_secs)
    }

    pub fn test_command(&self) -> Duration {
        Duration::from_secs(self.test_command_secs)
    }

    pub fn smoke(&self) -> Duration {
        Duration::from_secs(self.smoke_secs)
    }

    /// Timeout for git invocations during check/apply.
    pub fn apply_patch(&self) -> Duration {
        Duration::from_secs(self.apply_patch_secs.min(self.max_command_secs))
    }
}

/// Patch backend selection and repair budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatcherSection {
    #[serde(default)]
    pub mode: PatcherMode,
    /// Outer "propose fresh, validate" attempts for generative backends.
    #[serde(default = "default_patch_max_attempts")]
    pub patch_max_attempts: u32,
    /// Auto-repair iterations after post-checks fail.
    #[serde(default = "default_max_patch_iterations")]
    pub max_patch_iterations: u32,
}

fn default_patch_max_attempts() -> u32 {
    2
}

fn default_max_patch_iterations() -> u32 {
    2
}

impl Default for PatcherSection {
    fn default() -> Self {
        Self {
            mode: PatcherMode::default(),
            patch_max_attempts: default_patch_max_attempts(),
            max_patch_iterations: default_max_patch_iterations(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaSection {
    #[serde(default = "default_ollama_url")]
    pub url: String,
    #[serde(default = "default_ollama_model")]
    pub model: String,
    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_ollama_temperature")]
    pub temperature: f32,
    #[serde(default = "default_num_ctx")]
    pub num_ctx: u32,
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_ollama_model() -> String {
    "qwen2.5-coder:7b".to_string()
}

fn default_model_timeout_secs() -> u64 {
    300
}

fn default_ollama_temperature() -> f32 {
    0.1
}

fn default_num_ctx() -> u32 {
    8192
}

impl Default for OllamaSection {
    fn default() -> Self {
        Self {
            url: default_ollama_url(),
            model: default_ollama_model(),
            timeout_secs: default_model_timeout_secs(),
            temperature: default_ollama_temperature(),
            num_ctx: default_num_ctx(),
        }
    }
}

/// Text-generation-inference endpoint serving a (possibly fine-tuned) model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HfSection {
    #[serde(default = "default_hf_url")]
    pub url: String,
    #[serde(default = "default_hf_model")]
    pub model: String,
    /// LoRA adapter id passed to the endpoint; empty means the base model.
    #[serde(default)]
    pub adapter: String,
    #[serde(default = "default_hf_device")]
    pub device: String,
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: u32,
    #[serde(default = "default_hf_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum number of model handles kept by the model cache.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

fn default_hf_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_hf_model() -> String {
    "Qwen/Qwen2.5-Coder-0.5B-Instruct".to_string()
}

fn default_hf_device() -> String {
    "cpu".to_string()
}

fn default_max_new_tokens() -> u32 {
    800
}

fn default_hf_temperature() -> f32 {
    0.2
}

fn default_top_p() -> f32 {
    0.95
}

fn default_cache_capacity() -> usize {
    2
}

impl Default for HfSection {
    fn default() -> Self {
        Self {
            url: default_hf_url(),
            model: default_hf_model(),
            adapter: String::new(),
            device: default_hf_device(),
            max_new_tokens: default_max_new_tokens(),
            temperature: default_hf_temperature(),
            top_p: default_top_p(),
            timeout_secs: default_model_timeout_secs(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSection {
    #[serde(default = "default_context_max_files")]
    pub max_files: usize,
    #[serde(default = "default_context_max_chars")]
    pub max_chars: usize,
}

fn default_context_max_files() -> usize {
    8
}

fn default_context_max_chars() -> usize {
    12_000
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            max_files: default_context_max_files(),
            max_chars: default_context_max_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_lease_secs() -> u64 {
    900
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            lease_secs: default_lease_secs(),
        }
    }
}

/// The complete fixloop.toml configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FixloopConfig {
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub patcher: PatcherSection,
    #[serde(default)]
    pub ollama: OllamaSection,
    #[serde(default)]
    pub hf: HfSection,
    #[serde(default)]
    pub context: ContextSection,
    #[serde(default)]
    pub worker: WorkerSection,
}

impl FixloopConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse fixloop.toml")
    }

    /// Load from `path` if given, else `fixloop.toml` in `dir` when present,
    /// else defaults. Environment overrides are applied last.
    pub fn resolve(path: Option<&Path>, dir: &Path) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load(p)?,
            None => {
                let candidate = dir.join(CONFIG_FILE_NAME);
                if candidate.exists() {
                    Self::load(&candidate)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `FIXLOOP_*` overrides using the provided lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mode) = lookup("FIXLOOP_PATCHER_MODE") {
            self.patcher.mode = mode
                .parse()
                .with_context(|| "Invalid FIXLOOP_PATCHER_MODE".to_string())?;
        }
        if let Some(url) = lookup("FIXLOOP_OLLAMA_URL") {
            self.ollama.url = url;
        }
        if let Some(model) = lookup("FIXLOOP_OLLAMA_MODEL") {
            self.ollama.model = model;
        }
        if let Some(url) = lookup("FIXLOOP_HF_URL") {
            self.hf.url = url;
        }
        if let Some(db) = lookup("FIXLOOP_DATABASE") {
            self.paths.database = PathBuf::from(db);
        }
        if let Some(dir) = lookup("FIXLOOP_ARTIFACTS_DIR") {
            self.paths.artifacts_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("FIXLOOP_SANDBOX_DIR") {
            self.paths.sandbox_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Make relative paths absolute against `base`.
    pub fn anchor_paths(&mut self, base: &Path) {
        for p in [
            &mut self.paths.database,
            &mut self.paths.artifacts_dir,
            &mut self.paths.sandbox_dir,
        ] {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        }
    }

    /// Config rooted entirely under `dir`; used by tests and `fixloop init`.
    pub fn rooted_at(dir: &Path) -> Self {
        let mut config = Self::default();
        config.anchor_paths(dir);
        config
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize fixloop.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = FixloopConfig::default();
        assert_eq!(config.patcher.mode, PatcherMode::Rules);
        assert_eq!(config.patcher.patch_max_attempts, 2);
        assert_eq!(config.patcher.max_patch_iterations, 2);
        assert_eq!(config.timeouts.preflight_secs, 30);
        assert_eq!(config.timeouts.smoke_secs, 60);
        assert_eq!(config.context.max_files, 8);
        assert_eq!(config.context.max_chars, 12_000);
        assert!(config.paths.isolate_workspaces);
    }

    #[test]
    fn test_parse_partial_file_keeps_defaults() {
        let config = FixloopConfig::parse(
            r#"
[patcher]
mode = "ollama"
max_patch_iterations = 5

[ollama]
model = "codellama"
"#,
        )
        .unwrap();
        assert_eq!(config.patcher.mode, PatcherMode::Ollama);
        assert_eq!(config.patcher.max_patch_iterations, 5);
        assert_eq!(config.patcher.patch_max_attempts, 2);
        assert_eq!(config.ollama.model, "codellama");
        assert_eq!(config.ollama.url, "http://localhost:11434");
        assert_eq!(config.timeouts.test_command_secs, 300);
    }

    #[test]
    fn test_parse_rejects_unknown_mode() {
        let result = FixloopConfig::parse("[patcher]\nmode = \"gpt\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("FIXLOOP_PATCHER_MODE", "hf"),
            ("FIXLOOP_HF_URL", "http://tgi:80"),
            ("FIXLOOP_DATABASE", "/data/runs.db"),
        ]
        .into_iter()
        .collect();
        let mut config = FixloopConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.patcher.mode, PatcherMode::Hf);
        assert_eq!(config.hf.url, "http://tgi:80");
        assert_eq!(config.paths.database, PathBuf::from("/data/runs.db"));
    }

    #[test]
    fn test_env_override_invalid_mode_errors() {
        let mut config = FixloopConfig::default();
        let result = config.apply_env(|k| (k == "FIXLOOP_PATCHER_MODE").then(|| "nope".into()));
        assert!(result.is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut config = FixloopConfig::default();
        config.patcher.max_patch_iterations = 4;
        config.hf.adapter = "lora-7".into();
        config.save(&path).unwrap();

        let loaded = FixloopConfig::load(&path).unwrap();
        assert_eq!(loaded.patcher.max_patch_iterations, 4);
        assert_eq!(loaded.hf.adapter, "lora-7");
    }

    #[test]
    fn test_anchor_paths() {
        let dir = TempDir::new().unwrap();
        let config = FixloopConfig::rooted_at(dir.path());
        assert!(config.paths.database.starts_with(dir.path()));
        assert!(config.paths.sandbox_dir.starts_with(dir.path()));

        let mut absolute = FixloopConfig::default();
        absolute.paths.database = PathBuf::from("/abs/db.sqlite");
        absolute.anchor_paths(dir.path());
        assert_eq!(absolute.paths.database, PathBuf::from("/abs/db.sqlite"));
    }

    #[test]
    fn test_apply_patch_timeout_capped() {
        let mut t = TimeoutsSection::default();
        t.apply_patch_secs = 900;
        t.max_command_secs = 300;
        assert_eq!(t.apply_patch(), Duration::from_secs(300));
    }
}
