//! Patch validation and the bounded repair negotiation with a proposing
//! backend.
//!
//! ```text
//! propose ─► sanitize ─► structural check ─► git apply --check
//!    ▲                                             │ fail
//!    └──── one repair round-trip (diagnostic) ◄────┘
//! ```
//!
//! After `max_attempts` fresh proposals the backend is asked for whole-file
//! contents, which are diffed locally. When that also fails the last
//! candidate comes back with a `[Warning]` paragraph in its rationale.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::diffing::{Snapshot, unified_diff};
use super::sanitize::{looks_like_unified_diff, sanitize};
use super::{CHECK_PATCH_FILE, PatchProposal, is_no_change};
use crate::workspace::CommandRunner;

/// Rationale marker the pipeline treats as "validation exhausted".
pub const CHECK_WARNING_MARKER: &str = "git apply --check";

const MISSING_HEADERS: &str = "patch is not a valid unified diff (missing file headers)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Applies,
    Rejected(String),
}

impl CheckOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, CheckOutcome::Applies)
    }

    pub fn diagnostic(&self) -> &str {
        match self {
            CheckOutcome::Applies => "",
            CheckOutcome::Rejected(d) => d,
        }
    }
}

/// Dry-run applicability check against a working tree.
#[async_trait]
pub trait ApplyCheck: Send + Sync {
    async fn check(&self, diff: &str) -> Result<CheckOutcome>;
}

/// `git` invocations scoped to one sandbox.
#[derive(Debug, Clone)]
pub struct GitTool {
    runner: CommandRunner,
    timeout: Duration,
}

impl GitTool {
    pub fn new(root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            runner: CommandRunner::new(root),
            timeout,
        }
    }

    pub fn root(&self) -> &Path {
        self.runner.cwd()
    }

    /// Initialise a repository with one commit of the current tree so
    /// `git apply --check` has an index to work against.
    pub async fn ensure_repo(&self) -> Result<()> {
        if self.root().join(".git").exists() {
            return Ok(());
        }
        let init = self.git(&["init"]).await?;
        if !init.success() {
            bail!("Failed to init git repo for patch apply: {}", init.stderr.trim());
        }
        for args in [
            &["config", "user.email", "fixloop@local"][..],
            &["config", "user.name", "fixloop"][..],
            &["add", "-A"][..],
            &["commit", "-q", "-m", "init", "--allow-empty"][..],
        ] {
            let res = self.git(args).await?;
            if !res.success() {
                tracing::warn!(args = ?args, stderr = %res.stderr.trim(), "git setup command failed");
            }
        }
        tracing::debug!(root = %self.root().display(), "initialised sandbox git repo");
        Ok(())
    }

    async fn git(&self, args: &[&str]) -> Result<crate::workspace::CommandResult> {
        self.runner.run("git", args, self.timeout).await
    }

    /// Run `git apply` with `args` against a diff written to `file_name`.
    pub async fn apply_file(&self, file_name: &str, diff: &str, args: &[&str]) -> Result<CheckOutcome> {
        let path = self.root().join(file_name);
        std::fs::write(&path, diff)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        let mut full = vec!["apply"];
        full.extend_from_slice(args);
        full.push(file_name);
        let res = self.git(&full).await;
        let _ = std::fs::remove_file(&path);
        let res = res?;
        if res.success() {
            Ok(CheckOutcome::Applies)
        } else {
            Ok(CheckOutcome::Rejected(
                format!("{}\n{}", res.stdout, res.stderr).trim().to_string(),
            ))
        }
    }
}

#[async_trait]
impl ApplyCheck for GitTool {
    async fn check(&self, diff: &str) -> Result<CheckOutcome> {
        let text = sanitize(diff);
        if is_no_change(&text) {
            return Ok(CheckOutcome::Applies);
        }
        if !looks_like_unified_diff(&text) {
            return Ok(CheckOutcome::Rejected(MISSING_HEADERS.to_string()));
        }
        self.ensure_repo().await?;
        self.apply_file(CHECK_PATCH_FILE, &text, &["--check"]).await
    }
}

/// Whole-file replacement contents requested as a last resort.
#[derive(Debug, Clone, Default)]
pub struct FileEdits {
    pub title: String,
    pub rationale: String,
    pub files: BTreeMap<String, String>,
}

/// The proposing side of the negotiation.
#[async_trait]
pub trait ProposalSource: Send + Sync {
    /// A diff proposal; `extra` carries repair instructions for this round.
    async fn propose_diff(&self, extra: Option<&str>) -> Result<PatchProposal>;

    /// Full new contents for each changed file, or `None` when the backend
    /// produced nothing usable.
    async fn propose_files(&self, extra: &str) -> Result<Option<FileEdits>>;
}

/// Drives the validation/repair protocol for one proposal request.
pub struct PatchValidator<'a> {
    checker: &'a dyn ApplyCheck,
    root: &'a Path,
    max_attempts: usize,
}

impl<'a> PatchValidator<'a> {
    pub fn new(checker: &'a dyn ApplyCheck, root: &'a Path, max_attempts: usize) -> Self {
        Self {
            checker,
            root,
            max_attempts: max_attempts.max(1),
        }
    }

    async fn check(&self, proposal: &PatchProposal) -> Result<CheckOutcome> {
        if proposal.is_no_change() {
            return Ok(CheckOutcome::Applies);
        }
        self.checker.check(&proposal.diff).await
    }

    /// Check one proposal and, on rejection, spend one repair round-trip.
    async fn validate_or_repair(
        &self,
        source: &dyn ProposalSource,
        proposal: PatchProposal,
    ) -> Result<(PatchProposal, CheckOutcome)> {
        let outcome = self.check(&proposal).await?;
        if outcome.is_ok() {
            return Ok((proposal, outcome));
        }
        tracing::debug!(diagnostic = %outcome.diagnostic(), "proposal rejected, requesting repair");
        let extra = format!(
            "Your `diff` was rejected by `git apply --check` in the target repo. \
             Return a corrected unified diff that includes file headers (`diff --git`, `---`, `+++`) \
             and correct relative paths. Do not include explanations or markdown.\n\n\
             git apply --check error:\n{}\n\n\
             Here is your previous diff (rewrite it into a valid git patch):\n{}",
            outcome.diagnostic(),
            proposal.diff
        );
        let repaired = source.propose_diff(Some(&extra)).await?;
        let outcome = self.check(&repaired).await?;
        Ok((repaired, outcome))
    }

    pub async fn negotiate(&self, source: &dyn ProposalSource) -> Result<PatchProposal> {
        let mut last: Option<PatchProposal> = None;
        let mut last_err = String::new();

        for attempt in 1..=self.max_attempts {
            let extra = (attempt > 1).then(|| {
                let mut text = format!(
                    "This is attempt {}/{}. The previous patch was invalid. \
                     Fix the diff so that `git apply --check` passes.\n\nprevious_error:\n{}\n",
                    attempt, self.max_attempts, last_err
                );
                if let Some(prev) = &last {
                    text.push_str(&format!("\nprevious_diff:\n{}\n", prev.diff));
                }
                text
            });
            let candidate = source.propose_diff(extra.as_deref()).await?;
            let (proposal, outcome) = self.validate_or_repair(source, candidate).await?;
            if outcome.is_ok() {
                tracing::info!(attempt, "proposal passed git apply --check");
                return Ok(proposal);
            }
            tracing::warn!(attempt, max = self.max_attempts, "proposal still fails git apply --check");
            last_err = outcome.diagnostic().to_string();
            last = Some(proposal);
        }

        let mut fallback_extra = "All previous attempts failed `git apply --check`. \
             Return full new file contents instead of a diff. \
             Prefer minimal edits that fix the failing tests."
            .to_string();
        if !last_err.is_empty() {
            fallback_extra.push_str(&format!("\n\nlast_error:\n{}\n", last_err));
        }
        if let Some(edits) = source.propose_files(&fallback_extra).await?
            && let Some(proposal) = self.synthesize(edits)?
        {
            if self.check(&proposal).await?.is_ok() {
                tracing::info!("file-edit fallback produced an applicable diff");
                return Ok(proposal);
            }
        }

        let warning = format!(
            "[Warning] Patch still fails {} after {} attempts.\n{}",
            CHECK_WARNING_MARKER, self.max_attempts, last_err
        );
        match last {
            Some(proposal) => Ok(proposal.with_warning(&warning)),
            None => source.propose_diff(None).await,
        }
    }

    /// Diff whole-file edits against the sandbox. Unsafe paths are dropped.
    fn synthesize(&self, edits: FileEdits) -> Result<Option<PatchProposal>> {
        let mut before = Snapshot::new();
        let mut after = Snapshot::new();
        for (raw, content) in edits.files {
            let Some(rel) = safe_relative_path(&raw) else {
                tracing::warn!(path = %raw, "ignoring unsafe path in file edits");
                continue;
            };
            let path = self.root.join(&rel);
            if path.exists() {
                let current = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                before.insert(rel.clone(), current);
            }
            after.insert(rel, content);
        }
        if after.is_empty() {
            return Ok(None);
        }
        let title = if edits.title.trim().is_empty() {
            "LLM proposal".to_string()
        } else {
            edits.title.trim().to_string()
        };
        Ok(Some(PatchProposal::new(
            title,
            edits.rationale.trim(),
            unified_diff(&before, &after),
        )))
    }
}

/// Normalise a model-supplied path; `None` for anything escaping the root.
pub fn safe_relative_path(raw: &str) -> Option<String> {
    let mut rel = raw.trim();
    if let Some(stripped) = rel.strip_prefix("a/").or_else(|| rel.strip_prefix("b/")) {
        rel = stripped;
    }
    let rel = rel.trim_start_matches('/');
    if rel.is_empty() || rel.contains("..") || rel.starts_with(".git") {
        return None;
    }
    Some(rel.to_string())
}
