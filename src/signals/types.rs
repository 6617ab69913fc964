//! Structured failure signals.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Category of a failure fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    TestFailure,
    Lint,
    Runtime,
    Syntax,
    TypeError,
    Build,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TestFailure => "test_failure",
            Self::Lint => "lint",
            Self::Runtime => "runtime",
            Self::Syntax => "syntax",
            Self::TypeError => "type_error",
            Self::Build => "build",
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Error,
    Warning,
    Info,
}

/// Test-runner / compiler family used to pick a rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ecosystem {
    Python,
    JavaScript,
    Go,
    Rust,
}

impl FromStr for Ecosystem {
    type Err = String;

    /// Accepts the language names used in workspace profiles.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python" => Ok(Self::Python),
            "javascript" | "typescript" | "node" => Ok(Self::JavaScript),
            "go" | "golang" => Ok(Self::Go),
            "rust" => Ok(Self::Rust),
            other => Err(format!("Unknown ecosystem: {}", other)),
        }
    }
}

/// A structured failure fact extracted from raw tool output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BugSignal {
    pub kind: SignalKind,
    pub summary: String,
    pub details: String,
    /// e.g. `src/cart.py:24`; empty when unknown.
    #[serde(default)]
    pub file_hint: String,
    #[serde(default)]
    pub severity: Severity,
}

impl BugSignal {
    pub fn new(kind: SignalKind, summary: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            kind,
            summary: summary.into(),
            details: details.into(),
            file_hint: String::new(),
            severity: Severity::Error,
        }
    }

    pub fn with_file_hint(mut self, hint: impl Into<String>) -> Self {
        self.file_hint = hint.into();
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

/// Render signals as the bullet list fed to plans and backends.
pub fn render_signals(signals: &[BugSignal]) -> String {
    if signals.is_empty() {
        return "(no signals parsed from output)".to_string();
    }
    signals
        .iter()
        .map(|s| format!("- [{}] {}: {}", s.kind, s.summary, s.details))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_serializes_snake_case() {
        let sig = BugSignal::new(SignalKind::TypeError, "1 mypy error(s)", "a.py:3: bad")
            .with_file_hint("a.py");
        let json = serde_json::to_value(&sig).unwrap();
        assert_eq!(json["kind"], "type_error");
        assert_eq!(json["severity"], "error");
        assert_eq!(json["file_hint"], "a.py");
    }

    #[test]
    fn test_ecosystem_from_str() {
        assert_eq!("Python".parse::<Ecosystem>(), Ok(Ecosystem::Python));
        assert_eq!("typescript".parse::<Ecosystem>(), Ok(Ecosystem::JavaScript));
        assert_eq!("rust".parse::<Ecosystem>(), Ok(Ecosystem::Rust));
        assert!("cobol".parse::<Ecosystem>().is_err());
    }

    #[test]
    fn test_render_signals() {
        assert_eq!(render_signals(&[]), "(no signals parsed from output)");
        let sigs = vec![
            BugSignal::new(SignalKind::TestFailure, "1 test(s) FAILED", "tests/t.py::x - boom"),
            BugSignal::new(SignalKind::Lint, "2 lint issue(s)", "a.py:1:1 E501 long")
                .with_severity(Severity::Warning),
        ];
        assert_eq!(
            render_signals(&sigs),
            "- [test_failure] 1 test(s) FAILED: tests/t.py::x - boom\n- [lint] 2 lint issue(s): a.py:1:1 E501 long"
        );
    }
}
