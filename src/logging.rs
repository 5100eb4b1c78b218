//! Logging initialization: console output plus an optional daily-rotated
//! log file for after-the-fact debugging.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Directory for rotated log files.
    pub log_dir: String,
    /// Filter used when RUST_LOG is not set, e.g. "info,perfscope=debug".
    pub level_filter: String,
    /// Also write to a daily-rotated file under `log_dir`.
    pub file_output: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            level_filter: "info,perfscope=info".to_string(),
            file_output: false,
        }
    }
}

/// Initialize logging. The returned guard must stay alive for the program's
/// duration when file output is enabled, it flushes the background writer.
pub fn init_logging(
    config: &LoggingConfig,
) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error + Send + Sync>> {
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level_filter));
    // Diagnostics go to stderr so report output on stdout stays clean.
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(console_filter);

    if config.file_output {
        std::fs::create_dir_all(&config.log_dir)?;
        let file_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.level_filter));
        let appender = tracing_appender::rolling::daily(&config.log_dir, "perfscope.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let file_layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_filter(file_filter);

        tracing_subscriber::registry()
            .with(console_layer)
            .with(file_layer)
            .init();
        Ok(Some(guard))
    } else {
        tracing_subscriber::registry().with(console_layer).init();
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.log_dir, "logs");
        assert!(!config.file_output);
        assert!(config.level_filter.contains("perfscope"));
    }
}
