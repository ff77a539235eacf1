//! Logging for the sipsense daemon.
//!
//! On the hub (`SIPSENSE_ENV=production`) every event goes to a daily JSON file for later
//! inspection of link drops and drink detection, and a compact copy goes to stdout for
//! journald. On a workstation events are pretty-printed with span timings.
//!
//! The engine logs link transitions and rejected frames at `debug`, so raise
//! `sipsense_core` to `debug` when chasing a flaky bottle:
//!
//! ```bash
//! RUST_LOG=info,sipsense_core=debug sipsense-server
//! ```

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static STDOUT_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Environment variable selecting the logging mode.
pub const ENV_VAR: &str = "SIPSENSE_ENV";

/// Base level used when `RUST_LOG` is unset.
pub const LEVEL_VAR: &str = "SIPSENSE_LOG_LEVEL";

/// Overrides the production log directory.
pub const DIR_VAR: &str = "SIPSENSE_LOG_DIR";

/// Prefix of the rolling log files (`sipsense-server.2025-03-14`).
const FILE_PREFIX: &str = "sipsense-server";

/// Whether `SIPSENSE_ENV` asks for production logging.
#[must_use]
pub fn is_production() -> bool {
    std::env::var(ENV_VAR).is_ok_and(|value| value.eq_ignore_ascii_case("production"))
}

/// Filter directives for a base `level`.
///
/// Request tracing and the BlueZ bindings are chatty at `info`; they stay at `warn`
/// unless named explicitly in `RUST_LOG`.
#[must_use]
pub fn default_directives(level: &str) -> String {
    let level = level.trim();
    let level = if level.is_empty() { "info" } else { level };
    format!("{level},tower_http=warn,bluer=warn")
}

/// Install the global subscriber.
///
/// The filter comes from `RUST_LOG`, else [`default_directives`] of `SIPSENSE_LOG_LEVEL`.
///
/// # Errors
///
/// Returns an error if the filter does not parse or the log directory cannot be created.
pub fn init(is_production: bool) -> anyhow::Result<()> {
    let level = std::env::var(LEVEL_VAR).unwrap_or_default();
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(&level)))?;

    if is_production {
        init_production(env_filter)?;
    } else {
        init_development(env_filter);
    }
    Ok(())
}

fn init_production(env_filter: EnvFilter) -> anyhow::Result<()> {
    let log_dir = log_directory(std::env::var_os(DIR_VAR).map(PathBuf::from));
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, FILE_PREFIX);
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    // journald adds its own timestamp.
    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .without_time()
        .with_writer(stdout_writer)
        .with_target(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    let _ = FILE_GUARD.set(file_guard);
    let _ = STDOUT_GUARD.set(stdout_guard);

    tracing::info!(dir = %log_dir.display(), "File logging enabled");
    Ok(())
}

fn init_development(env_filter: EnvFilter) {
    let stdout_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .init();
}

/// Production log directory: the override if given, else the platform default.
fn log_directory(override_dir: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = override_dir.filter(|dir| !dir.as_os_str().is_empty()) {
        return dir;
    }
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/log/sipsense")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "sipsense")
            .map(|dirs| dirs.data_dir().join("logs"))
            .unwrap_or_else(|| PathBuf::from("./logs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_quiet_noisy_targets() {
        assert_eq!(default_directives("debug"), "debug,tower_http=warn,bluer=warn");
        assert_eq!(default_directives("  "), "info,tower_http=warn,bluer=warn");
        assert!(EnvFilter::try_new(default_directives("trace")).is_ok());
    }

    #[test]
    fn log_directory_prefers_override() {
        let dir = PathBuf::from("/tmp/sipsense-logs");
        assert_eq!(log_directory(Some(dir.clone())), dir);
        assert_ne!(log_directory(Some(PathBuf::new())), PathBuf::new());
        assert!(log_directory(None).to_string_lossy().contains("sipsense")
            || log_directory(None).ends_with("logs"));
    }
}
