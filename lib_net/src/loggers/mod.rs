//! Structured logging setup for the bundled binaries.
//!
//! Two entry points: [`setup_logging`] writes timestamped records to stdout
//! and a per-run log file (old runs are rotated away), [`setup_tracing`]
//! installs an env-filtered `tracing` subscriber for services that prefer
//! the tracing stack. Library code only ever logs through the `log` and
//! `tracing` facades.

use std::fs;
use std::path::Path;

use anyhow::Result;

/// Console + rotated-file logging for an application binary.
pub fn setup_logging(app_name: &str, log_dir: &Path, log_level: &str) -> Result<()> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    // Clean up old log files, keeping only the most recent one
    cleanup_old_logs(app_name, log_dir)?;

    let log_file_name = format!(
        "{app_name}_{}.log",
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = log_dir.join(log_file_name);

    let level = parse_level(log_level);

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .chain(fern::log_file(log_path)?)
        .apply()?;

    Ok(())
}

/// Env-filtered tracing subscriber (`RUST_LOG` wins over `log_level`).
pub fn setup_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Tracing with daily-rotated file output. The returned guard must be held
/// for the lifetime of the process or buffered records are lost.
pub fn setup_tracing_with_file(
    log_dir: &Path,
    prefix: &str,
    log_level: &str,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::EnvFilter;
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }
    let appender = tracing_appender::rolling::daily(log_dir, format!("{prefix}.log"));
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init();
    Ok(guard)
}

/// Plain env_logger for tests and one-shot tools.
pub fn setup_env_logging() {
    let _ = env_logger::Builder::from_default_env()
        .format_timestamp_millis()
        .try_init();
}

fn parse_level(log_level: &str) -> log::LevelFilter {
    match log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        "off" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

fn cleanup_old_logs(app_name: &str, log_dir: &Path) -> Result<()> {
    let prefix = format!("{app_name}_");
    let mut entries: Vec<_> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            name.starts_with(&prefix) && name.ends_with(".log")
        })
        .collect();

    // Sort by modification time, newest first
    entries.sort_by_key(|e| {
        std::cmp::Reverse(
            e.metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH),
        )
    });

    // Keep the most recent one (index 0), delete the rest
    for entry in entries.iter().skip(1) {
        if let Err(e) = fs::remove_file(entry.path()) {
            eprintln!("Failed to delete old log file {:?}: {e}", entry.path());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_parse_defaults_to_info() {
        assert_eq!(parse_level("DEBUG"), log::LevelFilter::Debug);
        assert_eq!(parse_level("nonsense"), log::LevelFilter::Info);
        assert_eq!(parse_level("off"), log::LevelFilter::Off);
    }

    #[test]
    fn old_logs_are_rotated_away() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["app_2024.log", "app_2025.log", "other_2025.log"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        cleanup_old_logs("app", dir.path()).unwrap();
        let remaining: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        // one app log survives, foreign files are untouched
        assert_eq!(remaining.iter().filter(|n| n.starts_with("app_")).count(), 1);
        assert!(remaining.contains(&"other_2025.log".to_string()));
    }
}
