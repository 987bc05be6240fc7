use crate::domain::settings::LogSettings;
use std::path::Path;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::{DefaultFields, Format};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

type FmtLayer<S, W> = fmt::Layer<S, DefaultFields, Format, W>;

/// Keeps the non-blocking file writer alive; logs are flushed on drop
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

fn rotation(name: &str) -> Rotation {
    match name.to_lowercase().as_str() {
        "hourly" => Rotation::HOURLY,
        "minutely" => Rotation::MINUTELY,
        "never" => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}

/// RUST_LOG wins over the configured level, "info" if neither parses
fn level_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Console and file output share one line format
fn styled<S, W>(layer: FmtLayer<S, W>, settings: &LogSettings) -> FmtLayer<S, W> {
    layer
        .with_file(settings.show_file_line)
        .with_line_number(settings.show_file_line)
        .with_thread_ids(settings.show_thread_ids)
        .with_target(settings.show_target)
}

fn file_writer(settings: &LogSettings) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    let dir = Path::new(&settings.log_dir);
    std::fs::create_dir_all(dir)?;
    let appender = RollingFileAppender::new(
        rotation(&settings.rotation),
        dir,
        &settings.file_name_prefix,
    );
    Ok(tracing_appender::non_blocking(appender))
}

pub fn init_logger(settings: &LogSettings) -> anyhow::Result<LoggingGuard> {
    let console = settings.console_logging_enabled.then(|| {
        styled(fmt::layer().with_writer(std::io::stderr), settings).with_ansi(settings.ansi_colors)
    });

    let (file, guard) = if settings.file_logging_enabled {
        let (writer, guard) = file_writer(settings)?;
        let layer = styled(fmt::layer().with_writer(writer), settings).with_ansi(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(level_filter(&settings.level))
        .with(console)
        .with(file)
        .try_init()?;

    tracing::info!(
        "Logging at {} (console: {}, file: {})",
        settings.level,
        settings.console_logging_enabled,
        settings.file_logging_enabled
    );

    Ok(LoggingGuard { _file: guard })
}
