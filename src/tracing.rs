use std::path::Path;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{prelude::*, EnvFilter};

use crate::config::Config;

/// Console output follows the configured level (`RUST_LOG` overrides it);
/// the rolling log file always captures debug and up.
pub fn init_tracing(config: &Config, logs_dir: &Path) {
    let mut layers = Vec::new();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter_str()));
    layers.push(
        tracing_subscriber::fmt::layer()
            .with_filter(env_filter)
            .boxed(),
    );

    let file_appender = tracing_appender::rolling::daily(logs_dir, "mcsweep.log");
    layers.push(
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender)
            .with_filter(LevelFilter::DEBUG)
            .boxed(),
    );

    tracing_subscriber::registry().with(layers).init();
}
