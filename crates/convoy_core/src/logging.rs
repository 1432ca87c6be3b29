use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info,convoy_core=debug,convoy_network=debug,convoy_app=debug";

/// Initializes logging with a daily-rolling file in `logs_dir` plus compact
/// console output. Returns a guard that must be kept alive for the duration
/// of the process.
pub fn init_logging(logs_dir: &std::path::Path, filter: &str) -> Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir)?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, "convoy");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .compact(),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(guard)
}

/// Default log directory: `<data dir>/convoy/logs`, or `./logs` when the
/// platform has no data directory.
pub fn default_logs_dir() -> std::path::PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("convoy").join("logs"))
        .unwrap_or_else(|| std::path::PathBuf::from("logs"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_creates_directory() {
        let tmp = tempfile::tempdir().expect("Failed to create tempdir");
        let logs_dir = tmp.path().join("nested").join("logs");
        assert!(!logs_dir.exists());

        // Only one global subscriber can be installed per process; the
        // directory is created either way.
        let result = init_logging(&logs_dir, "warn");
        assert!(logs_dir.exists());

        match result {
            Ok(guard) => drop(guard),
            Err(e) => {
                let msg = e.to_string();
                assert!(
                    msg.contains("logging") || msg.contains("subscriber"),
                    "unexpected error: {msg}"
                );
            }
        }
    }

    #[test]
    fn test_env_filter_fallback() {
        for f in [DEFAULT_FILTER, "debug", "warn", "convoy_network=trace,info"] {
            let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(f));
            drop(filter);
        }
    }

    #[test]
    fn test_default_logs_dir_ends_with_logs() {
        assert!(default_logs_dir().ends_with("logs"));
    }
}
