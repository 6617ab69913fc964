//! Per-run sandbox copies of a base workspace.
//!
//! Layout: `<sandbox_root>/<run_id>/...` mirrors the base workspace minus
//! version-control metadata and dependency/build directories. All commands
//! and patch applications for a run target its sandbox only; the base
//! workspace is never written.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::errors::RunError;

/// Directory names never copied into a sandbox.
pub const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    "__pycache__",
    ".pytest_cache",
    ".mypy_cache",
    ".ruff_cache",
    ".venv",
    "venv",
    "node_modules",
    "dist",
    "build",
    ".next",
    "target",
    ".fixloop",
];

/// Scratch files written by the patch applier.
pub const EXCLUDED_FILES: &[&str] = &[crate::patch::APPLY_PATCH_FILE, crate::patch::CHECK_PATCH_FILE];

#[derive(Debug, Clone)]
pub struct SandboxManager {
    root: PathBuf,
    isolate: bool,
}

impl SandboxManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            isolate: true,
        }
    }

    /// With isolation off every operation returns the base workspace itself.
    pub fn with_isolation(mut self, isolate: bool) -> Self {
        self.isolate = isolate;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, run_id: i64) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    /// Return the run's sandbox, copying the base workspace on first use.
    /// An existing sandbox is returned untouched.
    pub fn ensure(&self, run_id: i64, base: &Path) -> Result<PathBuf, RunError> {
        if !base.is_dir() {
            return Err(RunError::WorkspaceNotFound {
                path: base.to_path_buf(),
            });
        }
        if !self.isolate {
            return Ok(base.to_path_buf());
        }
        let dst = self.path_for(run_id);
        if dst.exists() {
            return Ok(dst);
        }
        let copied = copy_workspace(base, &dst).map_err(|e| {
            // A partial copy must not satisfy the next `ensure`.
            let _ = std::fs::remove_dir_all(&dst);
            RunError::Other(e)
        })?;
        tracing::info!(run_id, files = copied, sandbox = %dst.display(), "sandbox created");
        Ok(dst)
    }

    /// Destroy the sandbox and copy it fresh from the base workspace.
    pub fn reset(&self, run_id: i64, base: &Path) -> Result<PathBuf, RunError> {
        if !self.isolate {
            return self.ensure(run_id, base);
        }
        let dst = self.path_for(run_id);
        if dst.exists() {
            std::fs::remove_dir_all(&dst)
                .with_context(|| format!("Failed to remove sandbox {}", dst.display()))?;
        }
        self.ensure(run_id, base)
    }

    /// Best-effort recursive delete.
    pub fn cleanup(&self, run_id: i64) {
        if !self.isolate {
            return;
        }
        let dst = self.path_for(run_id);
        if dst.exists()
            && let Err(e) = std::fs::remove_dir_all(&dst)
        {
            tracing::warn!(run_id, error = %e, "failed to clean up sandbox");
        }
    }
}

fn should_skip(entry: &walkdir::DirEntry) -> bool {
    let Some(name) = entry.file_name().to_str() else {
        return false;
    };
    if entry.file_type().is_dir() {
        EXCLUDED_DIRS.contains(&name)
    } else {
        EXCLUDED_FILES.contains(&name)
    }
}

/// Copy `src` into `dst`, skipping excluded entries. Returns files copied.
fn copy_workspace(src: &Path, dst: &Path) -> Result<usize> {
    std::fs::create_dir_all(dst)
        .with_context(|| format!("Failed to create sandbox {}", dst.display()))?;
    let mut copied = 0;
    let walker = WalkDir::new(src)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !should_skip(e));
    for entry in walker {
        let entry = entry.context("Failed to walk base workspace")?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .context("Walked outside base workspace")?;
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn base_workspace() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("tinyshop")).unwrap();
        std::fs::write(root.join("tinyshop/pricing.py"), "def f():\n    return 1\n").unwrap();
        std::fs::create_dir_all(root.join(".git/objects")).unwrap();
        std::fs::write(root.join(".git/HEAD"), "ref").unwrap();
        std::fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        std::fs::write(root.join("node_modules/pkg/index.js"), "x").unwrap();
        std::fs::create_dir_all(root.join("tinyshop/__pycache__")).unwrap();
        std::fs::write(root.join("tinyshop/__pycache__/p.pyc"), "x").unwrap();
        std::fs::write(root.join(crate::patch::APPLY_PATCH_FILE), "diff").unwrap();
        dir
    }

    #[test]
    fn test_ensure_copies_and_excludes() {
        let base = base_workspace();
        let sandboxes = TempDir::new().unwrap();
        let mgr = SandboxManager::new(sandboxes.path());

        let path = mgr.ensure(42, base.path()).unwrap();
        assert_eq!(path, sandboxes.path().join("42"));
        assert!(path.join("tinyshop/pricing.py").exists());
        assert!(!path.join(".git").exists());
        assert!(!path.join("node_modules").exists());
        assert!(!path.join("tinyshop/__pycache__").exists());
        assert!(!path.join(crate::patch::APPLY_PATCH_FILE).exists());
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let base = base_workspace();
        let sandboxes = TempDir::new().unwrap();
        let mgr = SandboxManager::new(sandboxes.path());

        let first = mgr.ensure(1, base.path()).unwrap();
        std::fs::write(first.join("tinyshop/pricing.py"), "edited").unwrap();
        std::fs::write(base.path().join("new_in_base.txt"), "x").unwrap();

        let second = mgr.ensure(1, base.path()).unwrap();
        assert_eq!(first, second);
        // No second copy: edits survive and new base files are not pulled in.
        assert_eq!(
            std::fs::read_to_string(second.join("tinyshop/pricing.py")).unwrap(),
            "edited"
        );
        assert!(!second.join("new_in_base.txt").exists());
    }

    #[test]
    fn test_reset_restores_pristine_copy() {
        let base = base_workspace();
        let sandboxes = TempDir::new().unwrap();
        let mgr = SandboxManager::new(sandboxes.path());

        let path = mgr.ensure(5, base.path()).unwrap();
        std::fs::write(path.join("tinyshop/pricing.py"), "edited").unwrap();
        std::fs::write(path.join("stray.txt"), "x").unwrap();

        let path = mgr.reset(5, base.path()).unwrap();
        assert_eq!(
            std::fs::read_to_string(path.join("tinyshop/pricing.py")).unwrap(),
            "def f():\n    return 1\n"
        );
        assert!(!path.join("stray.txt").exists());
    }

    #[test]
    fn test_missing_base_is_fatal() {
        let sandboxes = TempDir::new().unwrap();
        let mgr = SandboxManager::new(sandboxes.path());
        let err = mgr
            .ensure(9, &sandboxes.path().join("does-not-exist"))
            .unwrap_err();
        assert!(matches!(err, RunError::WorkspaceNotFound { .. }));
        assert!(!mgr.path_for(9).exists());
    }

    #[test]
    fn test_missing_base_is_fatal_without_isolation() {
        let sandboxes = TempDir::new().unwrap();
        let mgr = SandboxManager::new(sandboxes.path()).with_isolation(false);
        let missing = sandboxes.path().join("does-not-exist");
        let err = mgr.ensure(9, &missing).unwrap_err();
        assert!(matches!(err, RunError::WorkspaceNotFound { .. }));
        assert!(mgr.reset(9, &missing).is_err());
        assert!(!missing.exists());
    }

    #[test]
    fn test_cleanup_removes_sandbox_and_tolerates_missing() {
        let base = base_workspace();
        let sandboxes = TempDir::new().unwrap();
        let mgr = SandboxManager::new(sandboxes.path());
        let path = mgr.ensure(3, base.path()).unwrap();
        mgr.cleanup(3);
        assert!(!path.exists());
        mgr.cleanup(3);
    }

    #[test]
    fn test_runs_never_share_a_sandbox() {
        let base = base_workspace();
        let sandboxes = TempDir::new().unwrap();
        let mgr = SandboxManager::new(sandboxes.path());
        let a = mgr.ensure(1, base.path()).unwrap();
        let b = mgr.ensure(2, base.path()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_isolation_off_uses_base() {
        let base = base_workspace();
        let sandboxes = TempDir::new().unwrap();
        let mgr = SandboxManager::new(sandboxes.path()).with_isolation(false);
        assert_eq!(mgr.ensure(1, base.path()).unwrap(), base.path());
        assert_eq!(mgr.reset(1, base.path()).unwrap(), base.path());
    }
}
