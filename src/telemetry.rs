//! Tracing subscriber setup for the `fixloop` binary.

use tracing_subscriber::{EnvFilter, prelude::*};

/// Default filter when `RUST_LOG` is unset.
pub fn default_filter(verbose: bool) -> String {
    let level = if verbose { "debug" } else { "info" };
    format!("warn,fixloop={level}")
}

/// Install the global subscriber. Logs go to stderr so stdout stays clean
/// for command output. Calling twice is a no-op.
pub fn init(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_levels() {
        assert_eq!(default_filter(false), "warn,fixloop=info");
        assert_eq!(default_filter(true), "warn,fixloop=debug");
    }

    #[test]
    fn init_twice_does_not_panic() {
        init(false, false);
        init(true, true);
    }
}
