use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub mod formatter;

pub use formatter::*;

use crate::configs::Config;

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` wins over the config file; otherwise `logging.level` and
/// `logging.filters` are joined into one directive string.
pub fn init(config: &Config) {
    let filter_str = filter_directives(config);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_str));

    let ansi = config
        .logging
        .as_ref()
        .map(|l| l.ansi)
        .unwrap_or(true);

    let stdout_layer = fmt::layer()
        .event_format(CustomFormatter::new(ansi))
        .with_ansi(ansi);

    // A second init (tests, embedding apps) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .try_init();
}

fn filter_directives(config: &Config) -> String {
    let log_level = config
        .logging
        .as_ref()
        .and_then(|l| l.level.as_deref())
        .unwrap_or("info");

    let filters = config
        .logging
        .as_ref()
        .and_then(|l| l.filters.as_deref())
        .unwrap_or("");

    // tungstenite logs every frame at debug; keep it quiet unless asked.
    if filters.is_empty() {
        format!("{},tungstenite=warn", log_level)
    } else {
        format!("{},tungstenite=warn,{}", log_level, filters)
    }
}
