//! Diagnostic logging to stderr; stdout is reserved for assistant output.

use tracing_subscriber::EnvFilter;

pub const LOG_ENV_VAR: &str = "ZAGENT_LOG";
pub const DEFAULT_LOG_FILTER: &str = "warn";

/// Filter directive: `ZAGENT_LOG`, then `RUST_LOG`, then `warn`.
pub fn filter_directive(zagent_log: Option<&str>, rust_log: Option<&str>) -> String {
    [zagent_log, rust_log]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|value| !value.is_empty())
        .unwrap_or(DEFAULT_LOG_FILTER)
        .to_string()
}

/// Installs the global subscriber. A second call is a no-op.
pub fn init() {
    let directive = filter_directive(
        std::env::var(LOG_ENV_VAR).ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    );
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zagent_log_wins_over_rust_log() {
        assert_eq!(filter_directive(Some("debug"), Some("info")), "debug");
        assert_eq!(filter_directive(Some("  "), Some("info")), "info");
        assert_eq!(filter_directive(None, None), DEFAULT_LOG_FILTER);
    }
}
