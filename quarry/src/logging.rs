//! Process-wide logging setup: stable severity levels
//! debug/info/success/warning/error. `tracing` has no native "success"
//! level, so it is modeled as a `tracing::info!` call tagged
//! `success = true`, printed as a bright-green checkmark line.

use clap::ValueEnum;
use colored::Colorize;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum LogLevel {
    #[default]
    Info,
    Verbose,
    Debug,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Level {
        match level {
            LogLevel::Info => Level::INFO,
            LogLevel::Verbose => Level::DEBUG,
            LogLevel::Debug => Level::TRACE,
        }
    }
}

/// Install the global `tracing` subscriber: no target, no thread IDs, no
/// timestamps in the default human-readable format.
pub fn init_logging(level: LogLevel) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::from(level))
        .with_target(false)
        .with_thread_ids(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Emit the "success" severity: a structured `info` event plus a
/// bright-green checkmark line on stdout.
pub fn success(message: &str) {
    info!(success = true, "{message}");
    println!("[{}] {message}", "✔".bright_green().bold());
}
