//! Tracing setup: human-readable stderr plus an optional JSON log file.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `filter` on stderr. When `log_dir` is
/// set, every event at debug and above is also written as JSON to
/// `<log_dir>/<file_name>`. Keep the returned guard alive until exit so
/// the file is flushed.
pub fn init(filter: &str, log_dir: Option<&Path>, file_name: &str) -> anyhow::Result<Option<WorkerGuard>> {
    let stderr_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(stderr_filter);

    let (json_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .try_init()?;
    Ok(guard)
}
