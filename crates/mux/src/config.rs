//! Logging configuration from the ambient process environment.
//!
//! `LOG_LEVEL` selects verbosity (ERROR, WARN, INFO, DEBUG; default INFO).
//! `LOG_FORMAT` selects `json` (one JSON object per line, the production
//! default) or `pretty` (human-readable, for development).

use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: &'static str,
    pub json: bool,
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self {
            level: level_from(&std::env::var("LOG_LEVEL").unwrap_or_default()),
            json: format_is_json(&std::env::var("LOG_FORMAT").unwrap_or_default()),
        }
    }

    /// Installs the global tracing subscriber. Call once, from the binary.
    ///
    /// Log lines go to stderr so command output on stdout stays parseable.
    pub fn init_tracing(&self) {
        let filter = EnvFilter::new(self.level);
        if self.json {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

fn level_from(raw: &str) -> &'static str {
    match raw.to_ascii_lowercase().as_str() {
        "error" => "error",
        "warn" => "warn",
        "debug" => "debug",
        _ => "info",
    }
}

fn format_is_json(raw: &str) -> bool {
    !matches!(raw.to_ascii_lowercase().as_str(), "pretty" | "text")
}
