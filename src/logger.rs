use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Verbosity of executor log records, ordered from quietest to noisiest.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    #[default]
    Info,
    Debug,
}

/// Write-only sink for the executor's leveled log records.
///
/// The executor only holds a shared reference, so the same sink can be
/// reused across executors and by the caller's own agent loop.
pub trait ExecutorLogger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

/// Forwards records to `tracing`, dropping anything noisier than `level`.
#[derive(Debug, Clone, Default)]
pub struct TracingLogger {
    level: LogLevel,
}

impl TracingLogger {
    pub fn new(level: LogLevel) -> Self {
        Self { level }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    fn enabled(&self, level: LogLevel) -> bool {
        level != LogLevel::Off && level <= self.level
    }
}

impl ExecutorLogger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str) {
        if !self.enabled(level) {
            return;
        }
        match level {
            LogLevel::Off => {}
            LogLevel::Error => tracing::error!(target: "codelet::executor", "{}", message),
            LogLevel::Info => tracing::info!(target: "codelet::executor", "{}", message),
            LogLevel::Debug => tracing::debug!(target: "codelet::executor", "{}", message),
        }
    }
}
