//! Snapshot-and-diff helpers. Diffs produced here carry correct headers by
//! construction, which makes them the fallback when generated diffs do not
//! apply.

use anyhow::{Context, Result};
use similar::TextDiff;
use std::collections::BTreeMap;
use std::path::Path;
use walkdir::WalkDir;

use super::NO_CHANGES;
use crate::workspace::sandbox::EXCLUDED_DIRS;

/// Relative path (forward slashes) to file contents.
pub type Snapshot = BTreeMap<String, String>;

/// Read every file under `root` whose name matches one of `patterns`.
pub fn snapshot_files(root: &Path, patterns: &[&str]) -> Result<Snapshot> {
    let globs = patterns
        .iter()
        .map(|p| glob::Pattern::new(p).with_context(|| format!("Invalid snapshot pattern {p}")))
        .collect::<Result<Vec<_>>>()?;

    let mut out = Snapshot::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir()
                && e.file_name()
                    .to_str()
                    .is_some_and(|n| EXCLUDED_DIRS.contains(&n)))
        });
    for entry in walker {
        let entry = entry.context("Failed to walk workspace")?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !globs.iter().any(|g| g.matches(&name)) {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .context("Walked outside workspace")?
            .to_string_lossy()
            .replace('\\', "/");
        let content = std::fs::read_to_string(entry.path())
            .with_context(|| format!("Failed to read {}", entry.path().display()))?;
        out.insert(rel, content);
    }
    Ok(out)
}

/// Write every snapshotted file back to its recorded contents.
pub fn restore_snapshot(root: &Path, snapshot: &Snapshot) -> Result<()> {
    for (rel, content) in snapshot {
        let path = root.join(rel);
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to restore {}", path.display()))?;
    }
    Ok(())
}

/// Git-style unified diff between two snapshots, paths in sorted order.
/// Returns [`NO_CHANGES`] when the snapshots are identical.
pub fn unified_diff(before: &Snapshot, after: &Snapshot) -> String {
    let mut paths: Vec<&String> = before.keys().chain(after.keys()).collect();
    paths.sort();
    paths.dedup();

    let mut out = String::new();
    for path in paths {
        let old = before.get(path);
        let new = after.get(path);
        let old_text = old.map(String::as_str).unwrap_or("");
        let new_text = new.map(String::as_str).unwrap_or("");
        if old.is_some() && new.is_some() && old_text == new_text {
            continue;
        }
        if old_text == new_text && old_text.is_empty() {
            continue;
        }

        out.push_str(&format!("diff --git a/{path} b/{path}\n"));
        let (from, to) = match (old, new) {
            (None, _) => {
                out.push_str("new file mode 100644\n");
                ("/dev/null".to_string(), format!("b/{path}"))
            }
            (_, None) => {
                out.push_str("deleted file mode 100644\n");
                (format!("a/{path}"), "/dev/null".to_string())
            }
            _ => (format!("a/{path}"), format!("b/{path}")),
        };
        let diff = TextDiff::from_lines(old_text, new_text);
        out.push_str(&diff.unified_diff().context_radius(3).header(&from, &to).to_string());
    }

    if out.is_empty() {
        NO_CHANGES.to_string()
    } else {
        out
    }
}
