use tracing_subscriber::EnvFilter;

/// Fallback variable when `RUST_LOG` is unset: `error`, `info`, `debug`...
pub const LOG_LEVEL_ENV: &str = "LOG_LEVEL";

/// Install the global `tracing` subscriber. Calling it twice is harmless.
pub fn init(default_level: &str) {
    let filter = filter(
        std::env::var(EnvFilter::DEFAULT_ENV).ok(),
        std::env::var(LOG_LEVEL_ENV).ok(),
        default_level,
    );
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}

fn filter(rust_log: Option<String>, log_level: Option<String>, default_level: &str) -> EnvFilter {
    [rust_log, log_level]
        .into_iter()
        .flatten()
        .filter(|directives| !directives.trim().is_empty())
        .find_map(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(default_level))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_log_wins_over_log_level() {
        let both = filter(Some("pool=debug".into()), Some("error".into()), "info");
        assert_eq!(both.to_string(), "pool=debug");

        let level_only = filter(None, Some("error".into()), "info");
        assert_eq!(level_only.to_string(), "error");

        let blank = filter(Some(" ".into()), None, "warn");
        assert_eq!(blank.to_string(), "warn");
    }
}
