//! Patch handling: normalising candidate diffs, local text diffing, the
//! git-backed dry-run and apply, and the validation/repair negotiation with a
//! proposing backend.

pub mod apply;
pub mod diffing;
pub mod sanitize;
pub mod validate;

use serde::{Deserialize, Serialize};

pub use apply::GitApplier;
pub use diffing::{snapshot_files, unified_diff};
pub use sanitize::{changed_files, looks_like_unified_diff, sanitize, strip_wrappers};
pub use validate::{ApplyCheck, CheckOutcome, GitTool, PatchValidator, ProposalSource};

/// Scratch file `git apply` reads when applying.
pub const APPLY_PATCH_FILE: &str = ".fixloop_patch.diff";
/// Scratch file `git apply --check` reads during validation.
pub const CHECK_PATCH_FILE: &str = ".fixloop_check.diff";

/// Diff text meaning "nothing to change".
pub const NO_CHANGES: &str = "(no changes)";
const NO_CHANGE_MARKERS: &[&str] = &[NO_CHANGES, "(no-op)", "no changes"];

/// A candidate patch before it is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchProposal {
    pub title: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub diff: String,
}

impl PatchProposal {
    pub fn new(title: impl Into<String>, rationale: impl Into<String>, diff: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            rationale: rationale.into(),
            diff: diff.into(),
        }
    }

    pub fn is_no_change(&self) -> bool {
        is_no_change(&self.diff)
    }

    /// Append a warning paragraph to the rationale.
    pub fn with_warning(mut self, warning: &str) -> Self {
        self.rationale = format!("{}\n\n{}", self.rationale, warning).trim().to_string();
        self
    }
}

/// Empty diffs and the conventional no-op markers.
pub fn is_no_change(diff: &str) -> bool {
    let t = diff.trim();
    t.is_empty() || NO_CHANGE_MARKERS.contains(&t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_change_markers() {
        assert!(is_no_change(""));
        assert!(is_no_change("  (no changes)\n"));
        assert!(is_no_change("(no-op)"));
        assert!(is_no_change("no changes"));
        assert!(!is_no_change("diff --git a/x b/x\n"));
    }

    #[test]
    fn test_with_warning_appends() {
        let p = PatchProposal::new("t", "because", "d").with_warning("[Warning] bad");
        assert_eq!(p.rationale, "because\n\n[Warning] bad");
        let p = PatchProposal::new("t", "", "d").with_warning("[Warning] bad");
        assert_eq!(p.rationale, "[Warning] bad");
    }

    #[test]
    fn test_proposal_json_shape() {
        let p: PatchProposal = serde_json::from_str(r#"{"title":"x"}"#).unwrap();
        assert_eq!(p.diff, "");
        let v = serde_json::to_value(PatchProposal::new("a", "b", "c")).unwrap();
        assert_eq!(v["title"], "a");
        assert_eq!(v["diff"], "c");
    }
}
