//! Structured Logger
//!
//! Console output (text or JSON) plus an optional daily-rolling NDJSON file,
//! with `RUST_LOG` taking precedence over the configured level.

use std::path::Path;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// `RUST_LOG` if set and valid, otherwise `level`.
pub fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init_logger(log_dir: Option<&Path>, level: &str, json: bool) {
    // Rolling file appender: writes NDJSON to `<dir>/relgate.log.YYYY-MM-DD`
    let file_layer = log_dir.map(|dir| {
        fmt::layer()
            .json()
            .with_writer(RollingFileAppender::new(Rotation::DAILY, dir, "relgate.log"))
            .with_ansi(false)
    });

    let json_console = json.then(|| fmt::layer().json().with_writer(std::io::stdout));
    let text_console = (!json).then(|| fmt::layer().with_writer(std::io::stdout).with_target(false));

    let _ = tracing_subscriber::registry()
        .with(build_filter(level))
        .with(json_console)
        .with(text_console)
        .with(file_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_level_applies_without_rust_log() {
        if std::env::var_os("RUST_LOG").is_none() {
            assert_eq!(build_filter("debug").to_string(), "debug");
        }
    }

    #[test]
    fn init_twice_is_harmless() {
        init_logger(None, "warn", false);
        init_logger(None, "warn", true);
        tracing::warn!("still logging");
    }
}
