//! Tracing subscriber setup shared by the `avllm` binary and integration tests

use tracing_subscriber::EnvFilter;

/// Crates whose log level `--debug` raises
const WORKSPACE_TARGETS: &[&str] = &[
    "avllm",
    "llama_common",
    "llama_loader",
    "llama_embedding",
    "llama_chat",
    "llama_server",
];

/// Build the filter used by [`init_tracing`]
///
/// `RUST_LOG` wins when set. Otherwise workspace crates log at `info`, or
/// `debug` when requested, and everything else at `warn`.
pub fn build_filter(debug: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = if debug { "debug" } else { "info" };
    let mut directives = String::from("warn");
    for target in WORKSPACE_TARGETS {
        directives.push_str(&format!(",{}={}", target, level));
    }
    if debug {
        directives.push_str(",tower_http=debug");
    }
    EnvFilter::new(directives)
}

/// Install the global fmt subscriber writing to stderr
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing(debug: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(build_filter(debug))
        .with_target(debug)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_filter_mentions_workspace_crates() {
        std::env::remove_var("RUST_LOG");
        let filter = build_filter(true).to_string();
        assert!(filter.contains("llama_chat=debug"));
        assert!(filter.contains("tower_http=debug"));

        let quiet = build_filter(false).to_string();
        assert!(quiet.contains("llama_server=info"));
        assert!(!quiet.contains("tower_http"));
    }

    #[test]
    #[serial]
    fn test_rust_log_overrides() {
        std::env::set_var("RUST_LOG", "trace");
        let filter = build_filter(false).to_string();
        std::env::remove_var("RUST_LOG");
        assert_eq!(filter, "trace");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_tracing(false);
        init_tracing(true);
    }
}
