//! Tracing bootstrap: human-readable stderr plus JSON lines on disk.

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use trainkit_core::DistributedContext;
use trainkit_core::config::LoggingConfig;

/// Verbosity flags from the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct Verbosity {
    pub verbose: u8,
    pub quiet: bool,
}

/// Console filter directive. Non-master ranks only print errors.
pub fn console_filter(verbosity: Verbosity, config: &LoggingConfig, dist: &DistributedContext) -> String {
    if !dist.is_master() {
        return "error".into();
    }
    match verbosity.verbose {
        0 if verbosity.quiet => "error".into(),
        0 => config.level.clone(),
        1 => "debug".into(),
        _ => "trace".into(),
    }
}

/// Directory for the JSON log files.
pub fn log_dir(config: &LoggingConfig) -> PathBuf {
    config.directory.clone().unwrap_or_else(|| {
        directories::ProjectDirs::from("dev", "trainkit", "trainkit")
            .map(|d| d.data_dir().join("logs"))
            .unwrap_or_else(|| PathBuf::from("."))
    })
}

fn log_file_name(dist: &DistributedContext) -> String {
    if dist.is_distributed() {
        format!("trainkit.rank{}.log", dist.rank)
    } else {
        "trainkit.log".into()
    }
}

/// Install the global subscriber. Keep the returned guard alive for the
/// whole process or buffered file output is lost.
pub fn init(
    verbosity: Verbosity,
    config: &LoggingConfig,
    dist: &DistributedContext,
) -> Option<WorkerGuard> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(console_filter(verbosity, config, dist)));

    let (json_layer, guard) = if config.json_file {
        let dir = log_dir(config);
        let _ = std::fs::create_dir_all(&dir);
        let file_appender = tracing_appender::rolling::daily(&dir, log_file_name(dist));
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_filter(EnvFilter::new("debug"));
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let _ = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .try_init();
    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker() -> DistributedContext {
        DistributedContext {
            rank: 3,
            local_rank: 1,
            world_size: 4,
        }
    }

    #[test]
    fn test_console_filter_levels() {
        let config = LoggingConfig::default();
        let single = DistributedContext::single();
        let level = |verbose, quiet| console_filter(Verbosity { verbose, quiet }, &config, &single);
        assert_eq!(level(0, false), "info");
        assert_eq!(level(0, true), "error");
        assert_eq!(level(1, false), "debug");
        assert_eq!(level(3, false), "trace");
    }

    #[test]
    fn test_console_filter_uses_configured_level() {
        let config = LoggingConfig {
            level: "warn,trainkit_core=debug".into(),
            ..LoggingConfig::default()
        };
        let filter = console_filter(Verbosity::default(), &config, &DistributedContext::single());
        assert_eq!(filter, "warn,trainkit_core=debug");
    }

    #[test]
    fn test_worker_ranks_only_print_errors() {
        let verbosity = Verbosity {
            verbose: 2,
            quiet: false,
        };
        assert_eq!(console_filter(verbosity, &LoggingConfig::default(), &worker()), "error");
    }

    #[test]
    fn test_log_locations() {
        let config = LoggingConfig {
            directory: Some(PathBuf::from("/tmp/trainkit-logs")),
            ..LoggingConfig::default()
        };
        assert_eq!(log_dir(&config), PathBuf::from("/tmp/trainkit-logs"));
        assert_eq!(log_file_name(&DistributedContext::single()), "trainkit.log");
        assert_eq!(log_file_name(&worker()), "trainkit.rank3.log");
    }
}
