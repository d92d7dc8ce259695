use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::{self, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

const LOG_FILE: &str = "comics-down.log";

/// Keeps the file writer flushing until dropped.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Logs go to stderr so stdout stays clean JSON. With `log_dir` a daily
/// rolling file receives the same events without colours.
pub fn init(debug: bool, log_dir: Option<&Path>) -> Result<LogGuard> {
    let level = if debug { LevelFilter::DEBUG } else { LevelFilter::INFO };

    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(debug)
        .with_filter(level);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("create log dir {}", dir.display()))?;
            let appender = rolling::daily(dir, LOG_FILE);
            let (writer, guard) = non_blocking::NonBlockingBuilder::default()
                .lossy(false)
                .finish(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(level);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init()
        .context("install log subscriber")?;

    Ok(LogGuard { _file: guard })
}
