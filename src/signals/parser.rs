//! Rule sets turning raw test/compiler output into `BugSignal`s.
//!
//! One rule set per ecosystem. Each applies its rules in order and emits at
//! most one signal per rule; a catch-all keeps the result non-empty whenever
//! the output mentions a failure or an error.

use super::types::{BugSignal, Ecosystem, Severity, SignalKind};
use crate::util::{head_chars, tail_chars};
use regex::Regex;
use std::sync::LazyLock;

// ── pytest / flake8 / mypy ───────────────────────────────────────────────

static PYTEST_FAILED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"FAILED\s+(.*?)\s+-\s+(.*)").unwrap());

static PYTEST_ASSERTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(AssertionError[^\n]*(?:\n(?:E\s+[^\n]+|\s+[^\n]+)){0,8})").unwrap()
});

static PYTEST_COLLECTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ERROR collecting\s+(.+)").unwrap());

static PY_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"((?:ModuleNotFoundError|ImportError)[^\n]*)").unwrap());

static PY_SYNTAX_LOCATED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"File "([^"]+)", line (\d+).*\n.*\nSyntaxError: (.*)"#).unwrap()
});

static PY_SYNTAX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(SyntaxError[^\n]*)").unwrap());

/// (exception name, detail line, traceback location) in priority order.
static PY_EXCEPTIONS: LazyLock<Vec<(&'static str, Regex, Regex)>> = LazyLock::new(|| {
    [
        "TypeError",
        "ValueError",
        "AttributeError",
        "KeyError",
        "RuntimeError",
        "NameError",
        "IndexError",
    ]
    .into_iter()
    .map(|exc| {
        (
            exc,
            Regex::new(&format!(r"({}[^\n]*)", exc)).unwrap(),
            Regex::new(&format!(r#"File "([^"]+)", line (\d+).*\n.*\n.*{}"#, exc)).unwrap(),
        )
    })
    .collect()
});

static PY_LINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([^\s:]+\.py):(\d+):(\d+):\s+(E\d+|W\d+|F\d+)\s+(.*)").unwrap()
});

static PY_MYPY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([^\s:]+\.py):(\d+): (error|note): (.*)").unwrap());

static PYTEST_SHORT_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+\s+failed(?:,\s*\d+\s+passed)?(?:,\s*\d+\s+error)?)").unwrap()
});

// ── jest / vitest / mocha / tsc ──────────────────────────────────────────

static JEST_FAIL_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*FAIL\s+(.+)").unwrap());

static JEST_TEST_BULLET: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"●\s+(.+)").unwrap());

static JEST_EXPECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(Expected:.*\n\s*Received:.*)").unwrap());

static JS_EXCEPTIONS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    ["TypeError", "ReferenceError", "SyntaxError"]
        .into_iter()
        .map(|exc| (exc, Regex::new(&format!(r"({}: [^\n]+)", exc)).unwrap()))
        .collect()
});

static JS_STACK_FRAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"at .+ \(([^)]+):(\d+):\d+\)").unwrap());

static TSC_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([\w./\\-]+\.tsx?)\((\d+),\d+\): error TS\d+: (.*)").unwrap()
});

// ── go ───────────────────────────────────────────────────────────────────

static GO_FAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"--- FAIL:\s+(\S+)\s+\((.+?)\)").unwrap());

static GO_COMPILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([\w./\\-]+\.go):(\d+):\d+: (.*)").unwrap());

// ── cargo ────────────────────────────────────────────────────────────────

static CARGO_TEST_FAILED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"test (.+) \.\.\. FAILED").unwrap());

static CARGO_ERROR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"error(?:\[E\d+\])?: (.*)").unwrap());

const PYTHON_EXCERPT_CHARS: usize = 3000;
const DEFAULT_EXCERPT_CHARS: usize = 2000;

/// Dispatches raw tool output to the matching ecosystem rule set.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalExtractor;

impl SignalExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Extract signals from a command's output. Never fails.
    ///
    /// The rule set is chosen by content sniffing first; the hint only
    /// decides when no marker is present. Python is the final default.
    pub fn extract(&self, stdout: &str, stderr: &str, hint: Option<Ecosystem>) -> Vec<BugSignal> {
        let text = format!("{}\n{}", stdout, stderr);
        let ecosystem = sniff(&text).or(hint).unwrap_or(Ecosystem::Python);
        tracing::debug!(?ecosystem, ?hint, "selected signal rule set");
        match ecosystem {
            Ecosystem::Python => self.from_pytest(&text),
            Ecosystem::JavaScript => self.from_jest(&text),
            Ecosystem::Go => self.from_go(&text),
            Ecosystem::Rust => self.from_cargo(&text),
        }
    }

    pub fn from_pytest(&self, text: &str) -> Vec<BugSignal> {
        let mut signals = Vec::new();

        let fails: Vec<(&str, &str)> = PYTEST_FAILED
            .captures_iter(text)
            .filter_map(|c| Some((c.get(1)?.as_str(), c.get(2)?.as_str())))
            .collect();
        if let Some((first, _)) = fails.first() {
            let details = fails
                .iter()
                .take(20)
                .map(|(a, b)| format!("  {} - {}", a, b))
                .collect::<Vec<_>>()
                .join("\n");
            let file_hint = first.split("::").next().unwrap_or_default();
            signals.push(
                BugSignal::new(
                    SignalKind::TestFailure,
                    format!("{} test(s) FAILED", fails.len()),
                    details,
                )
                .with_file_hint(file_hint),
            );
        }

        if let Some(m) = PYTEST_ASSERTION.find(text) {
            signals.push(BugSignal::new(
                SignalKind::TestFailure,
                "AssertionError",
                head_chars(m.as_str(), 1000).trim(),
            ));
        }

        let collection: Vec<&str> = PYTEST_COLLECTION
            .captures_iter(text)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect();
        if let Some(first) = collection.first() {
            signals.push(
                BugSignal::new(
                    SignalKind::Runtime,
                    format!("Collection error in {} file(s)", collection.len()),
                    collection.iter().take(5).copied().collect::<Vec<_>>().join("\n"),
                )
                .with_file_hint(*first),
            );
        }

        if text.contains("ModuleNotFoundError") || text.contains("ImportError") {
            let details = PY_IMPORT
                .find(text)
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| "ModuleNotFoundError or ImportError detected".to_string());
            signals.push(BugSignal::new(SignalKind::Runtime, "Import error", details));
        }

        if let Some(c) = PY_SYNTAX_LOCATED.captures(text) {
            let file = &c[1];
            let line = &c[2];
            signals.push(
                BugSignal::new(
                    SignalKind::Syntax,
                    format!("SyntaxError: {}", c[3].trim()),
                    format!("File: {}, line {}", file, line),
                )
                .with_file_hint(format!("{}:{}", file, line)),
            );
        } else if let Some(m) = PY_SYNTAX.find(text) {
            signals.push(BugSignal::new(
                SignalKind::Syntax,
                "SyntaxError",
                head_chars(m.as_str(), 300),
            ));
        }

        // First exception type present wins.
        for (exc, detail_re, location_re) in PY_EXCEPTIONS.iter() {
            if !text.contains(exc) {
                continue;
            }
            if let Some(m) = detail_re.find(text) {
                let hint = location_re
                    .captures(text)
                    .map(|c| format!("{}:{}", &c[1], &c[2]))
                    .unwrap_or_default();
                signals.push(
                    BugSignal::new(SignalKind::Runtime, *exc, head_chars(m.as_str(), 400))
                        .with_file_hint(hint),
                );
                break;
            }
        }

        let lint: Vec<regex::Captures> = PY_LINT.captures_iter(text).collect();
        if let Some(first) = lint.first() {
            let details = lint
                .iter()
                .take(10)
                .map(|c| format!("{}:{}:{} {} {}", &c[1], &c[2], &c[3], &c[4], &c[5]))
                .collect::<Vec<_>>()
                .join("\n");
            signals.push(
                BugSignal::new(
                    SignalKind::Lint,
                    format!("{} lint issue(s)", lint.len()),
                    details,
                )
                .with_file_hint(&first[1])
                .with_severity(Severity::Warning),
            );
        }

        let mypy_errors: Vec<regex::Captures> = PY_MYPY
            .captures_iter(text)
            .filter(|c| &c[3] == "error")
            .collect();
        if let Some(first) = mypy_errors.first() {
            let details = mypy_errors
                .iter()
                .take(10)
                .map(|c| format!("{}:{}: {}", &c[1], &c[2], &c[4]))
                .collect::<Vec<_>>()
                .join("\n");
            signals.push(
                BugSignal::new(
                    SignalKind::TypeError,
                    format!("{} mypy error(s)", mypy_errors.len()),
                    details,
                )
                .with_file_hint(&first[1]),
            );
        }

        if signals.is_empty()
            && let Some(m) = PYTEST_SHORT_SUMMARY.find(text)
        {
            signals.push(BugSignal::new(
                SignalKind::TestFailure,
                "Tests failed",
                m.as_str(),
            ));
        }

        fallback(
            signals,
            text,
            "Tests failed (see details)",
            PYTHON_EXCERPT_CHARS,
        )
    }

    pub fn from_jest(&self, text: &str) -> Vec<BugSignal> {
        let mut signals = Vec::new();

        let fail_files: Vec<&str> = JEST_FAIL_FILE
            .captures_iter(text)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect();
        if let Some(first) = fail_files.first() {
            signals.push(
                BugSignal::new(
                    SignalKind::TestFailure,
                    format!("{} test file(s) FAILED", fail_files.len()),
                    fail_files.iter().take(10).copied().collect::<Vec<_>>().join("\n"),
                )
                .with_file_hint(*first),
            );
        }

        let bullets: Vec<&str> = JEST_TEST_BULLET
            .captures_iter(text)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect();
        if !bullets.is_empty() {
            signals.push(BugSignal::new(
                SignalKind::TestFailure,
                format!("{} test(s) failed", bullets.len()),
                bullets.iter().take(10).copied().collect::<Vec<_>>().join("\n"),
            ));
        }

        if let Some(m) = JEST_EXPECT.find(text) {
            signals.push(BugSignal::new(
                SignalKind::TestFailure,
                "Assertion mismatch",
                head_chars(m.as_str(), 400),
            ));
        }

        for (exc, re) in JS_EXCEPTIONS.iter() {
            if let Some(m) = re.find(text) {
                let hint = JS_STACK_FRAME
                    .captures(text)
                    .map(|c| format!("{}:{}", &c[1], &c[2]))
                    .unwrap_or_default();
                signals.push(
                    BugSignal::new(SignalKind::Runtime, *exc, head_chars(m.as_str(), 400))
                        .with_file_hint(hint),
                );
                break;
            }
        }

        let ts: Vec<regex::Captures> = TSC_ERROR.captures_iter(text).collect();
        if let Some(first) = ts.first() {
            signals.push(
                BugSignal::new(
                    SignalKind::TypeError,
                    format!("{} TypeScript error(s)", ts.len()),
                    ts.iter()
                        .take(10)
                        .map(|c| format!("{}:{}: {}", &c[1], &c[2], &c[3]))
                        .collect::<Vec<_>>()
                        .join("\n"),
                )
                .with_file_hint(&first[1]),
            );
        }

        fallback(signals, text, "Tests/build failed", DEFAULT_EXCERPT_CHARS)
    }

    pub fn from_go(&self, text: &str) -> Vec<BugSignal> {
        let mut signals = Vec::new();

        let fails: Vec<regex::Captures> = GO_FAIL.captures_iter(text).collect();
        if !fails.is_empty() {
            signals.push(BugSignal::new(
                SignalKind::TestFailure,
                format!("{} Go test(s) FAILED", fails.len()),
                fails
                    .iter()
                    .take(10)
                    .map(|c| format!("{} ({})", &c[1], &c[2]))
                    .collect::<Vec<_>>()
                    .join("\n"),
            ));
        }

        let compile: Vec<regex::Captures> = GO_COMPILE.captures_iter(text).collect();
        if let Some(first) = compile.first() {
            signals.push(
                BugSignal::new(
                    SignalKind::Syntax,
                    format!("{} compile error(s)", compile.len()),
                    compile
                        .iter()
                        .take(10)
                        .map(|c| format!("{}:{}: {}", &c[1], &c[2], &c[3]))
                        .collect::<Vec<_>>()
                        .join("\n"),
                )
                .with_file_hint(&first[1]),
            );
        }

        fallback(signals, text, "Go tests failed", DEFAULT_EXCERPT_CHARS)
    }

    pub fn from_cargo(&self, text: &str) -> Vec<BugSignal> {
        let mut signals = Vec::new();

        let fails: Vec<&str> = CARGO_TEST_FAILED
            .captures_iter(text)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect();
        if !fails.is_empty() {
            signals.push(BugSignal::new(
                SignalKind::TestFailure,
                format!("{} Rust test(s) FAILED", fails.len()),
                fails.iter().take(10).copied().collect::<Vec<_>>().join("\n"),
            ));
        }

        let errors: Vec<&str> = CARGO_ERROR
            .captures_iter(text)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect();
        if !errors.is_empty() {
            signals.push(BugSignal::new(
                SignalKind::Build,
                format!("{} Rust compile error(s)", errors.len()),
                errors.iter().take(5).copied().collect::<Vec<_>>().join("\n"),
            ));
        }

        fallback(signals, text, "Cargo test failed", DEFAULT_EXCERPT_CHARS)
    }
}

/// Pick a rule set from distinctive markers in the output.
fn sniff(text: &str) -> Option<Ecosystem> {
    let lower = text.to_lowercase();
    if text.contains("pytest")
        || text.contains("PASSED")
        || (text.contains("FAILED") && text.contains(".py"))
    {
        return Some(Ecosystem::Python);
    }
    if text.contains("FAIL\t") || text.contains("--- FAIL:") || text.contains(".go:") {
        return Some(Ecosystem::Go);
    }
    if lower.contains("cargo") || text.contains(".rs:") {
        return Some(Ecosystem::Rust);
    }
    if lower.contains("jest")
        || lower.contains("vitest")
        || lower.contains("mocha")
        || text.contains(".tsx")
        || text.contains(".ts:")
    {
        return Some(Ecosystem::JavaScript);
    }
    None
}

/// Catch-all: when nothing structured matched but the output mentions a
/// failure, emit one signal carrying the tail of the output.
fn fallback(
    mut signals: Vec<BugSignal>,
    text: &str,
    summary: &str,
    excerpt_chars: usize,
) -> Vec<BugSignal> {
    if signals.is_empty() {
        let lower = text.to_lowercase();
        if lower.contains("fail") || lower.contains("error") {
            signals.push(BugSignal::new(
                SignalKind::TestFailure,
                summary,
                tail_chars(text.trim(), excerpt_chars),
            ));
        }
    }
    signals
}

/// Convenience wrapper around [`SignalExtractor::extract`].
pub fn extract_signals(stdout: &str, stderr: &str, hint: Option<Ecosystem>) -> Vec<BugSignal> {
    SignalExtractor::new().extract(stdout, stderr, hint)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PYTEST_OUTPUT: &str = "\
============================= test session starts ==============================
collected 2 items

tests/test_pricing.py::test_discount_rounding FAILED                     [ 50%]
tests/test_pricing.py::test_percent_is_clamped PASSED                    [100%]

=================================== FAILURES ===================================
    def test_discount_rounding():
>       assert apply_discount(995, 10) == 896
E       AssertionError: assert 895 == 896
E        +  where 895 = apply_discount(995, 10)

tests/test_pricing.py:8: AssertionError
=========================== short test summary info ============================
FAILED tests/test_pricing.py::test_discount_rounding - AssertionError: assert 895 == 896
========================= 1 failed, 1 passed in 0.03s ==========================
";

    #[test]
    fn test_pytest_failed_and_assertion() {
        let signals = extract_signals(PYTEST_OUTPUT, "", None);
        assert_eq!(signals[0].kind, SignalKind::TestFailure);
        assert_eq!(signals[0].summary, "1 test(s) FAILED");
        assert_eq!(signals[0].file_hint, "tests/test_pricing.py");
        assert!(signals[0].details.contains("assert 895 == 896"));
        assert_eq!(signals[1].summary, "AssertionError");
        assert!(signals[1].details.starts_with("AssertionError: assert 895 == 896"));
    }

    #[test]
    fn test_pytest_one_signal_per_rule() {
        let text = format!("{}\n{}", PYTEST_OUTPUT, PYTEST_OUTPUT);
        let signals = extract_signals(&text, "", None);
        let failed = signals.iter().filter(|s| s.summary.ends_with("FAILED")).count();
        let assertion = signals.iter().filter(|s| s.summary == "AssertionError").count();
        assert_eq!(failed, 1);
        assert_eq!(assertion, 1);
        assert_eq!(signals[0].summary, "2 test(s) FAILED");
    }

    #[test]
    fn test_pytest_syntax_error_with_location() {
        let text = "pytest run\n  File \"src/cart.py\", line 12\n    def x(:\n          ^\nSyntaxError: invalid syntax\n";
        let extractor = SignalExtractor::new();
        let signals = extractor.from_pytest(text);
        // The located form needs the message exactly two lines after `File`.
        let syntax = signals.iter().find(|s| s.kind == SignalKind::Syntax).unwrap();
        assert_eq!(syntax.summary, "SyntaxError");

        let located = "  File \"src/cart.py\", line 12\n    def x(:\nSyntaxError: invalid syntax\n";
        let signals = extractor.from_pytest(located);
        let syntax = signals.iter().find(|s| s.kind == SignalKind::Syntax).unwrap();
        assert_eq!(syntax.summary, "SyntaxError: invalid syntax");
        assert_eq!(syntax.file_hint, "src/cart.py:12");
    }

    #[test]
    fn test_pytest_collection_and_import_errors() {
        let text = "ERROR collecting tests/test_api.py\nE   ModuleNotFoundError: No module named 'fastapi'\n";
        let signals = SignalExtractor::new().from_pytest(text);
        assert_eq!(signals[0].summary, "Collection error in 1 file(s)");
        assert_eq!(signals[0].file_hint, "tests/test_api.py");
        assert_eq!(signals[1].summary, "Import error");
        assert!(signals[1].details.contains("No module named 'fastapi'"));
    }

    #[test]
    fn test_pytest_first_exception_wins_with_location() {
        let text = "Traceback (most recent call last):\n  File \"app/main.py\", line 3, in <module>\n    run()\nKeyError: 'x'\nValueError: later\n";
        let signals = SignalExtractor::new().from_pytest(text);
        let runtime: Vec<_> = signals
            .iter()
            .filter(|s| s.kind == SignalKind::Runtime)
            .collect();
        assert_eq!(runtime.len(), 1);
        // ValueError precedes KeyError in the rule order.
        assert_eq!(runtime[0].summary, "ValueError");
        assert_eq!(runtime[0].details, "ValueError: later");
    }

    #[test]
    fn test_lint_and_mypy() {
        let text = "src/a.py:3:80: E501 line too long\nsrc/a.py:4:1: F401 unused import\nsrc/b.py:9: error: Incompatible types\nsrc/b.py:10: note: see here\n";
        let signals = SignalExtractor::new().from_pytest(text);
        let lint = signals.iter().find(|s| s.kind == SignalKind::Lint).unwrap();
        assert_eq!(lint.summary, "2 lint issue(s)");
        assert_eq!(lint.severity, Severity::Warning);
        assert_eq!(lint.file_hint, "src/a.py");
        let mypy = signals.iter().find(|s| s.kind == SignalKind::TypeError).unwrap();
        assert_eq!(mypy.summary, "1 mypy error(s)");
        assert_eq!(mypy.details, "src/b.py:9: Incompatible types");
    }

    #[test]
    fn test_jest_output() {
        let text = "\
 FAIL  src/cart.test.ts
  ● cart › applies discount

    Expected: 896
    Received: 895

      at Object.<anonymous> (src/cart.test.ts:12:5)
";
        let signals = extract_signals(text, "", None);
        assert_eq!(signals[0].summary, "1 test file(s) FAILED");
        assert_eq!(signals[0].file_hint, "src/cart.test.ts");
        assert_eq!(signals[1].summary, "1 test(s) failed");
        assert_eq!(signals[2].summary, "Assertion mismatch");
        assert!(signals[2].details.contains("Received: 895"));
    }

    #[test]
    fn test_go_output() {
        let text = "--- FAIL: TestDiscount (0.00s)\n    cart_test.go:14: got 895 want 896\nFAIL\tshop/cart\t0.01s\n";
        let signals = extract_signals(text, "", None);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].summary, "1 Go test(s) FAILED");
        assert_eq!(signals[0].details, "TestDiscount (0.00s)");

        let build = "# shop/cart\n./cart.go:14:5: undefined: applyDiscount\n";
        let signals = extract_signals(build, "", None);
        assert_eq!(signals[0].kind, SignalKind::Syntax);
        assert_eq!(signals[0].summary, "1 compile error(s)");
        assert_eq!(signals[0].file_hint, "./cart.go");
    }

    #[test]
    fn test_cargo_output() {
        let text = "running 2 tests\ntest cart::discount ... FAILED\ntest cart::tax ... ok\nerror: test failed, to rerun pass `--lib`\n";
        let signals = extract_signals(text, "", Some(Ecosystem::Rust));
        assert_eq!(signals[0].summary, "1 Rust test(s) FAILED");
        assert_eq!(signals[0].details, "cart::discount");
        assert_eq!(signals[1].kind, SignalKind::Build);
    }

    #[test]
    fn test_hint_used_when_sniffing_inconclusive() {
        let text = "test widgets::spin ... FAILED\n";
        let hinted = extract_signals(text, "", Some(Ecosystem::Rust));
        assert_eq!(hinted[0].summary, "1 Rust test(s) FAILED");
        // Without a hint the Python rule set runs and falls back.
        let unhinted = extract_signals(text, "", None);
        assert_eq!(unhinted[0].summary, "Tests failed (see details)");
    }

    #[test]
    fn test_sniffing_beats_hint() {
        let signals = extract_signals(PYTEST_OUTPUT, "", Some(Ecosystem::Go));
        assert_eq!(signals[0].summary, "1 test(s) FAILED");
    }

    #[test]
    fn test_fallback_guarantees_signal_for_every_rule_set() {
        let extractor = SignalExtractor::new();
        for text in ["something Failed badly", "an ERROR happened"] {
            assert_eq!(extractor.from_pytest(text).len(), 1);
            assert_eq!(extractor.from_jest(text).len(), 1);
            assert_eq!(extractor.from_go(text).len(), 1);
            assert_eq!(extractor.from_cargo(text).len(), 1);
        }
    }

    #[test]
    fn test_fallback_uses_trailing_excerpt() {
        let noisy = format!("{}the build failed at the end", "x".repeat(5000));
        let signals = SignalExtractor::new().from_pytest(&noisy);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].details.chars().count(), PYTHON_EXCERPT_CHARS);
        assert!(signals[0].details.ends_with("failed at the end"));

        let signals = SignalExtractor::new().from_go(&noisy);
        assert_eq!(signals[0].details.chars().count(), DEFAULT_EXCERPT_CHARS);
    }

    #[test]
    fn test_clean_output_yields_nothing() {
        assert!(extract_signals("all good\n3 passed", "", None).is_empty());
        assert!(extract_signals("", "", None).is_empty());
    }
}
