use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::WegentDirs;

/// Filter directives used when `RUST_LOG` is unset: the wegent crates at
/// debug, everything else at info.
const DEFAULT_DIRECTIVES: &str =
    "info,wegent_core=debug,wegent_api=debug,wegent_gateway=debug,wegent_task=debug";

/// Initializes logging for the client core.
///
/// The core is embedded in a host application, so it writes only to rotated
/// files under `~/.wegent/logs`; stdout belongs to the host. Returns a guard
/// that must be kept alive for the duration of the process, or buffered log
/// lines are lost on exit.
pub fn init_logging() -> Result<WorkerGuard> {
    init_logging_to_dir(&WegentDirs::logs_dir()?, DEFAULT_DIRECTIVES)
}

/// Initialize logging to a custom directory with custom filter directives.
/// Useful for tests or embedders that relocate `~/.wegent`.
pub fn init_logging_to_dir(logs_dir: &std::path::Path, directives: &str) -> Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir)?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(logs_dir, "wegent.log"));

    let filter = match EnvFilter::try_from_default_env() {
        Ok(from_env) => from_env,
        Err(_) => EnvFilter::try_new(directives)
            .map_err(|e| anyhow::anyhow!("Bad log directives {directives:?}: {e}"))?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(writer)
        .finish()
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_to_dir_creates_directory() {
        let tmp = tempfile::tempdir().expect("Failed to create tempdir");
        let logs_dir = tmp.path().join("nested").join("logs");
        assert!(!logs_dir.exists());

        // Only one global subscriber can be installed per process, so these
        // tests assert the filesystem effects and tolerate either outcome of
        // try_init.
        let guard = init_logging_to_dir(&logs_dir, "warn");
        assert!(logs_dir.exists());
        drop(guard);
    }

    #[test]
    fn init_logging_to_dir_existing_directory() {
        let tmp = tempfile::tempdir().expect("Failed to create tempdir");
        let logs_dir = tmp.path().join("logs");
        std::fs::create_dir_all(&logs_dir).unwrap();

        let result = init_logging_to_dir(&logs_dir, "info");
        assert!(logs_dir.exists());
        drop(result);
    }

    #[test]
    fn bad_directives_are_rejected() {
        let tmp = tempfile::tempdir().expect("Failed to create tempdir");
        // An unparseable directive string should error rather than install a
        // silently-broken filter. (Skipped when RUST_LOG is set, since the
        // environment takes precedence.)
        if std::env::var_os("RUST_LOG").is_none() {
            let result = init_logging_to_dir(tmp.path(), "not==a==directive");
            assert!(result.is_err());
        }
    }
}
