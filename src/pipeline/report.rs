//! Step 11 report rendering.

use std::path::Path;

use crate::artifacts::file_name;
use crate::patch::changed_files;
use crate::store::Step;

pub struct ReportInput<'a> {
    pub run_id: i64,
    pub title: &'a str,
    pub sandbox: &'a Path,
    pub profile: &'a str,
    pub steps: &'a [Step],
    /// Latest `proposal.diff`, when one was written.
    pub diff: Option<&'a str>,
}

pub fn render_report(input: &ReportInput<'_>) -> String {
    let mut lines: Vec<String> = vec![
        format!("# fixloop report: {}", input.title),
        String::new(),
        format!("- **run_id**: `{}`", input.run_id),
        format!("- **sandbox**: `{}`", input.sandbox.display()),
        format!("- **profile**: `{}`", input.profile),
        format!("- **generated_at**: {}", chrono::Utc::now().to_rfc3339()),
        String::new(),
        "## Steps".to_string(),
    ];

    for step in input.steps {
        let mut line = format!("- {}. **{}** `{}`", step.order, step.name, step.status);
        if !step.summary.is_empty() {
            line.push_str(&format!(": {}", step.summary));
        }
        lines.push(line);
        if !step.error.is_empty() {
            lines.push(format!("  - error: {}", step.error));
        }
        if !step.log_path.is_empty() {
            lines.push(format!("  - log: `{}`", file_name(&step.log_path)));
        }
        if !step.artifact_path.is_empty() {
            lines.push(format!("  - artifact: `{}`", file_name(&step.artifact_path)));
        }
    }

    lines.push(String::new());
    lines.push("## Changed files".to_string());
    let files = input.diff.map(changed_files).unwrap_or_default();
    if files.is_empty() {
        lines.push("- (No code diff detected)".to_string());
    } else {
        lines.extend(files.iter().map(|f| format!("- `{}`", f)));
    }

    lines.push(String::new());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StepStatus;

    fn step(order: i64, name: &str, status: StepStatus) -> Step {
        Step {
            id: order,
            run_id: 1,
            order,
            name: name.into(),
            status,
            summary: String::new(),
            error: String::new(),
            log_path: String::new(),
            artifact_path: String::new(),
            started_at: None,
            finished_at: None,
        }
    }

    #[test]
    fn test_report_lists_steps_and_changed_files() {
        let mut preflight = step(1, "Preflight", StepStatus::Success);
        preflight.summary = "OK".into();
        preflight.log_path = "/art/1/preflight.log".into();
        let mut apply = step(8, "Apply patch", StepStatus::Failed);
        apply.error = "Apply failed".into();
        apply.artifact_path = "/art/1/apply_error.txt".into();
        let steps = vec![preflight, apply];
        let diff = "diff --git a/x.py b/x.py\n--- a/x.py\n+++ b/x.py\n@@ -1 +1 @@\n-a\n+b\n";

        let report = render_report(&ReportInput {
            run_id: 1,
            title: "Fix rounding",
            sandbox: Path::new("/sb/1"),
            profile: "default",
            steps: &steps,
            diff: Some(diff),
        });
        assert!(report.starts_with("# fixloop report: Fix rounding"));
        assert!(report.contains("- 1. **Preflight** `success`: OK\n  - log: `preflight.log`"));
        assert!(report.contains("  - error: Apply failed\n  - artifact: `apply_error.txt`"));
        assert!(report.contains("## Changed files\n- `x.py`"));
    }

    #[test]
    fn test_report_without_diff() {
        let report = render_report(&ReportInput {
            run_id: 2,
            title: "t",
            sandbox: Path::new("/sb/2"),
            profile: "default",
            steps: &[],
            diff: None,
        });
        assert!(report.contains("- (No code diff detected)"));
        assert!(report.ends_with("- (No code diff detected)\n"));
    }
}
