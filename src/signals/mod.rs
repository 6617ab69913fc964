//! Failure-signal extraction.
//!
//! Turns raw test-runner / compiler output into an ordered list of
//! structured `BugSignal`s that feed the plan and the repair loop:
//!
//! - pytest, flake8/ruff and mypy output
//! - jest / vitest / mocha and tsc output
//! - `go test` output
//! - `cargo test` / rustc output
//!
//! Extraction is a pure text transform and never fails.

mod parser;
mod types;

pub use parser::{SignalExtractor, extract_signals};
pub use types::{BugSignal, Ecosystem, Severity, SignalKind, render_signals};
