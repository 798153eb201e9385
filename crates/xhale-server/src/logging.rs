//! Tracing subscriber setup.
//!
//! - **Production** (`XHALE_ENV=production`): JSON lines to a daily-rolling
//!   file plus compact stdout for the journal
//! - **Development**: pretty stdout with span open/close events
//!
//! The filter comes from `RUST_LOG`, then `XHALE_LOG_LEVEL`, then `info`.
//! When it is a plain level, the session manager and duration tracker are
//! still logged at `warn` or more verbose, so lost links, unresolved sensor
//! addresses and failed duration writes are never filtered out.

use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Targets that report degraded session modes at `warn`.
const DEGRADED_MODE_TARGETS: [&str; 2] = ["xhale_core::manager", "xhale_core::duration"];

/// Non-blocking writers stop flushing once their guard drops.
static GUARDS: OnceLock<(WorkerGuard, WorkerGuard)> = OnceLock::new();

/// Whether `XHALE_ENV` selects production logging.
#[must_use]
pub fn is_production() -> bool {
    std::env::var("XHALE_ENV").is_ok_and(|env| env.eq_ignore_ascii_case("production"))
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns an error if the filter does not parse or the production log
/// directory cannot be created.
pub fn init(is_production: bool) -> anyhow::Result<()> {
    let spec = std::env::var("RUST_LOG")
        .or_else(|_| std::env::var("XHALE_LOG_LEVEL"))
        .unwrap_or_else(|_| "info".to_string());
    let directives = filter_directives(&spec);
    let env_filter = EnvFilter::try_new(&directives)
        .with_context(|| format!("invalid log filter '{directives}'"))?;

    if is_production {
        init_production(env_filter)
    } else {
        init_development(env_filter);
        Ok(())
    }
}

/// Expand a plain level into per-target directives that keep the
/// degraded-mode targets at `warn` or above. Directive lists are returned
/// unchanged, as is `off`.
fn filter_directives(spec: &str) -> String {
    let Ok(level) = spec.trim().parse::<LevelFilter>() else {
        return spec.to_string();
    };
    if level == LevelFilter::OFF {
        return spec.to_string();
    }
    let floor = level.max(LevelFilter::WARN);
    std::iter::once(level.to_string())
        .chain(DEGRADED_MODE_TARGETS.iter().map(|target| format!("{target}={floor}")))
        .collect::<Vec<_>>()
        .join(",")
}

fn init_production(env_filter: EnvFilter) -> anyhow::Result<()> {
    let log_dir = log_directory();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("cannot create log directory {}", log_dir.display()))?;

    let (file_writer, file_guard) = tracing_appender::non_blocking(RollingFileAppender::new(
        Rotation::DAILY,
        &log_dir,
        "xhale",
    ));
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    // journald adds its own timestamps and does not render ANSI.
    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(stdout_writer)
        .with_target(true)
        .without_time()
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    let _ = GUARDS.set((file_guard, stdout_guard));
    Ok(())
}

fn init_development(env_filter: EnvFilter) {
    let stdout_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .init();
}

/// `/var/log/xhale` on Linux, the platform data directory elsewhere.
fn log_directory() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/log/xhale")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "xhale")
            .map_or_else(|| PathBuf::from("./logs"), |dirs| dirs.data_dir().join("logs"))
    }
}
