//! Tracing subscriber setup for the `brain` binary.
//!
//! Log lines go to stderr so stdout stays clean for JSON output. The level
//! comes from `RUST_LOG` when set, otherwise from the caller's default
//! directive.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_DIRECTIVE: &str = "info";

/// Filter from `RUST_LOG`, falling back to `default_directive`.
pub fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Install the global subscriber: env filter plus a compact fmt layer on
/// stderr. Fails if a global subscriber is already set.
pub fn init(default_directive: &str) -> Result<(), String> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter(default_directive))
        .with(fmt_layer)
        .try_init()
        .map_err(|e| format!("failed to initialise logging: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_directive_is_used() {
        // RUST_LOG may be set in CI; only check the fallback when it is not.
        if std::env::var_os("RUST_LOG").is_none() {
            assert_eq!(env_filter("debug").to_string(), "debug");
        }
    }
}
