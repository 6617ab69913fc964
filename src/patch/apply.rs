//! Applying a validated proposal to a sandbox with `git apply`.

use anyhow::{Context, Result, bail};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use super::sanitize::{hunk_header, looks_like_unified_diff, sanitize};
use super::validate::{CheckOutcome, GitTool, safe_relative_path};
use super::{APPLY_PATCH_FILE, CHECK_PATCH_FILE, PatchProposal, is_no_change};

static PLUS_B_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\+\+\+\s+b/(.+)").unwrap());
static PLUS_ANY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\+\+\+\s+(.+)").unwrap());

/// One file's portion of a multi-file diff.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileSection {
    lines: Vec<String>,
}

impl FileSection {
    fn target(&self) -> Option<String> {
        let found = self
            .lines
            .iter()
            .find_map(|l| PLUS_B_RE.captures(l).map(|c| c[1].trim().to_string()))
            .or_else(|| {
                self.lines
                    .iter()
                    .find_map(|l| PLUS_ANY_RE.captures(l).map(|c| c[1].trim().to_string()))
            })?;
        if found == "/dev/null" || found == "dev/null" {
            return None;
        }
        Some(found)
    }

    fn hunks(&self) -> impl Iterator<Item = (usize, usize, usize, usize)> + '_ {
        self.lines.iter().filter_map(|l| hunk_header(l))
    }

    fn has_from_empty_hunk(&self) -> bool {
        self.hunks().any(|(start, count, _, _)| start == 0 && count == 0)
    }

    /// Every `+` line after the first hunk header, prefix removed.
    fn added_content(&self) -> String {
        let mut out = String::new();
        let mut in_hunk = false;
        for line in &self.lines {
            if line.starts_with("@@") {
                in_hunk = true;
                continue;
            }
            if in_hunk && let Some(rest) = line.strip_prefix('+') {
                out.push_str(rest);
                out.push('\n');
            }
        }
        out
    }

    fn text(&self) -> String {
        let mut s = self.lines.join("\n");
        s.push('\n');
        s
    }
}

/// Split on `diff --git` headers, and on `--- ` headers that open a new
/// file rather than continue the current one.
fn split_sections(diff: &str) -> Vec<FileSection> {
    let mut sections: Vec<FileSection> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_has_body = false;
    for line in diff.lines() {
        let opens = line.starts_with("diff --git ") || (line.starts_with("--- ") && current_has_body);
        if opens && !current.is_empty() {
            sections.push(FileSection {
                lines: std::mem::take(&mut current),
            });
            current_has_body = false;
        }
        if line.starts_with("--- ") || line.starts_with("@@") {
            current_has_body = true;
        }
        current.push(line.to_string());
    }
    if !current.is_empty() {
        sections.push(FileSection { lines: current });
    }
    sections.retain(|s| s.lines.iter().any(|l| !l.trim().is_empty()));
    sections
}

/// Sections that would prepend onto an existing file: their only hunk is
/// `@@ -0,0 +...` and the target exists in `root`.
fn add_only_sections(root: &Path, sections: &[FileSection]) -> Vec<(usize, PathBuf)> {
    let mut found = Vec::new();
    for (i, section) in sections.iter().enumerate() {
        if !section.has_from_empty_hunk() {
            continue;
        }
        let Some(rel) = section.target().and_then(|t| safe_relative_path(&t)) else {
            continue;
        };
        let path = root.join(&rel);
        if !path.exists() {
            continue;
        }
        if section.hunks().count() > 1 {
            tracing::warn!(
                file = %rel,
                "from-empty hunk mixed with other hunks for an existing file; leaving it to git apply"
            );
            continue;
        }
        found.push((i, path));
    }
    found
}

/// Applies proposals inside one sandbox.
#[derive(Debug, Clone)]
pub struct GitApplier {
    git: GitTool,
}

impl GitApplier {
    pub fn new(root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            git: GitTool::new(root, timeout),
        }
    }

    pub fn git(&self) -> &GitTool {
        &self.git
    }

    /// Apply the proposal's diff and return its title. Errors carry the raw
    /// `git apply` diagnostic.
    pub async fn apply(&self, proposal: &PatchProposal) -> Result<String> {
        let diff = sanitize(&proposal.diff);
        if is_no_change(&diff) {
            return Ok(proposal.title.clone());
        }
        if !looks_like_unified_diff(&diff) {
            bail!(
                "Patch is not a valid unified diff (missing file headers). \
                 Ask for a full `git diff` style patch with diff --git/---/+++ lines."
            );
        }

        let sections = split_sections(&diff);
        let overwrites = add_only_sections(self.git.root(), &sections);
        let rest: String = sections
            .iter()
            .enumerate()
            .filter(|(i, _)| !overwrites.iter().any(|(j, _)| j == i))
            .map(|(_, s)| s.text())
            .collect();

        if !rest.trim().is_empty() {
            self.git.ensure_repo().await?;
            if let CheckOutcome::Rejected(diag) =
                self.git.apply_file(CHECK_PATCH_FILE, &rest, &["--check"]).await?
            {
                bail!("Patch failed `git apply --check`.\n{}", diag);
            }
        }

        for (i, path) in &overwrites {
            tracing::info!(file = %path.display(), "replacing file from add-only hunk");
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            std::fs::write(path, sections[*i].added_content())
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }

        if !rest.trim().is_empty()
            && let CheckOutcome::Rejected(diag) = self
                .git
                .apply_file(APPLY_PATCH_FILE, &rest, &["--whitespace=nowarn"])
                .await?
        {
            bail!("Patch failed `git apply`.\n{}", diag);
        }
        Ok(proposal.title.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn applier(dir: &TempDir) -> GitApplier {
        GitApplier::new(dir.path(), Duration::from_secs(30))
    }

    #[test]
    fn test_split_sections() {
        let diff = "diff --git a/a b/a\n--- a/a\n+++ b/a\n@@ -1 +1 @@\n-x\n+y\n--- a/b\n+++ b/b\n@@ -0,0 +1 @@\n+z\n";
        let sections = split_sections(diff);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].target().as_deref(), Some("a"));
        assert_eq!(sections[1].target().as_deref(), Some("b"));
        assert!(!sections[0].has_from_empty_hunk());
        assert!(sections[1].has_from_empty_hunk());
        assert_eq!(sections[1].added_content(), "z\n");
    }

    #[tokio::test]
    async fn test_add_only_hunk_overwrites_existing_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("calc.py"), "def f():\n    return 1\n").unwrap();
        let proposal = PatchProposal::new(
            "Rewrite calc",
            "",
            "diff --git a/calc.py b/calc.py\n--- a/calc.py\n+++ b/calc.py\n@@ -0,0 +1,2 @@\n+def f():\n+    return 2\n",
        );
        let title = applier(&dir).apply(&proposal).await.unwrap();
        assert_eq!(title, "Rewrite calc");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("calc.py")).unwrap(),
            "def f():\n    return 2\n"
        );
        // No patch tool involved.
        assert!(!dir.path().join(".git").exists());
    }

    #[tokio::test]
    async fn test_no_change_is_noop() {
        let dir = TempDir::new().unwrap();
        let title = applier(&dir)
            .apply(&PatchProposal::new("No-op proposal", "", "(no changes)"))
            .await
            .unwrap();
        assert_eq!(title, "No-op proposal");
        assert!(!dir.path().join(".git").exists());
    }

    #[tokio::test]
    async fn test_headerless_diff_is_rejected() {
        let dir = TempDir::new().unwrap();
        let err = applier(&dir)
            .apply(&PatchProposal::new("t", "", "@@ -1 +1 @@\n-a\n+b\n"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing file headers"));
    }

    #[tokio::test]
    async fn test_git_apply_with_miscounted_header() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("x.py"), "a\nb\nc\n").unwrap();
        let proposal = PatchProposal::new(
            "Edit",
            "",
            "```diff\ndiff --git a/x.py b/x.py\n--- a/x.py\n+++ b/x.py\n@@ -1,7 +1,9 @@\n a\n-b\n+B\n c\n```",
        );
        applier(&dir).apply(&proposal).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("x.py")).unwrap(), "a\nB\nc\n");
        assert!(!dir.path().join(APPLY_PATCH_FILE).exists());
    }

    #[tokio::test]
    async fn test_git_apply_failure_carries_diagnostic() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("x.py"), "a\n").unwrap();
        let proposal = PatchProposal::new(
            "Edit",
            "",
            "diff --git a/x.py b/x.py\n--- a/x.py\n+++ b/x.py\n@@ -1 +1 @@\n-nope\n+b\n",
        );
        let err = applier(&dir).apply(&proposal).await.unwrap_err();
        assert!(err.to_string().starts_with("Patch failed `git apply --check`."));
        assert_eq!(std::fs::read_to_string(dir.path().join("x.py")).unwrap(), "a\n");
    }

    #[tokio::test]
    async fn test_mixed_diff_overwrites_and_applies_rest() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.py"), "old\n").unwrap();
        std::fs::write(dir.path().join("b.py"), "x\n").unwrap();
        let diff = "diff --git a/a.py b/a.py\n--- a/a.py\n+++ b/a.py\n@@ -0,0 +1 @@\n+new\ndiff --git a/b.py b/b.py\n--- a/b.py\n+++ b/b.py\n@@ -1 +1 @@\n-x\n+y\n";
        applier(&dir)
            .apply(&PatchProposal::new("Mixed", "", diff))
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("a.py")).unwrap(), "new\n");
        assert_eq!(std::fs::read_to_string(dir.path().join("b.py")).unwrap(), "y\n");
    }
}
