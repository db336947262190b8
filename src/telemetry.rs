//! Process-wide tracing subscriber.
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

use crate::config::LogSettings;

fn filter_directive(settings: &LogSettings) -> String {
    std::env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| format!("stockpost={},sled=warn", settings.level))
}

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
///
/// Returns false when a subscriber was already installed, so calling it more
/// than once is harmless.
pub fn init(settings: &LogSettings) -> bool {
    let filter = EnvFilter::try_new(filter_directive(settings))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = if settings.json {
        fmt().with_env_filter(filter).json().try_init()
    } else {
        fmt().with_env_filter(filter).try_init()
    };
    installed.is_ok()
}
