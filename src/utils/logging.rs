//! Injectable logging capability.
//!
//! Components receive a [`SharedLog`] at construction instead of calling the
//! `log` facade directly, so tests can capture or silence their output.
//!
//! Usage:
//! ```rust
//! use sensor_logger::sink_info;
//! use sensor_logger::utils::logging::{FacadeLog, SharedLog};
//!
//! let log: SharedLog = FacadeLog::shared("sensor_logger::demo");
//! sink_info!(log, "opened {} candidates", 3);
//! ```

use std::{
    fmt,
    sync::{Arc, Mutex},
};

pub use log::Level;

/// Destination for component log records.
pub trait LogSink: Send + Sync {
    fn record(&self, level: Level, args: fmt::Arguments<'_>);
}

pub type SharedLog = Arc<dyn LogSink>;

/// Forwards records to the global `log` facade under a fixed target.
pub struct FacadeLog {
    target: &'static str,
}

impl FacadeLog {
    pub fn new(target: &'static str) -> Self {
        Self { target }
    }

    pub fn shared(target: &'static str) -> SharedLog {
        Arc::new(Self::new(target))
    }
}

impl LogSink for FacadeLog {
    fn record(&self, level: Level, args: fmt::Arguments<'_>) {
        log::log!(target: self.target, level, "{}", args);
    }
}

/// Drops everything.
pub struct SilentLog;

impl SilentLog {
    pub fn shared() -> SharedLog {
        Arc::new(SilentLog)
    }
}

impl LogSink for SilentLog {
    fn record(&self, _level: Level, _args: fmt::Arguments<'_>) {}
}

/// Keeps every record in memory; used by tests to assert on diagnostics.
#[derive(Default)]
pub struct MemoryLog {
    records: Mutex<Vec<(Level, String)>>,
}

impl MemoryLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<(Level, String)> {
        match self.records.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.records()
            .iter()
            .any(|(lvl, msg)| *lvl == level && msg.contains(needle))
    }
}

impl LogSink for MemoryLog {
    fn record(&self, level: Level, args: fmt::Arguments<'_>) {
        let mut guard = match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push((level, args.to_string()));
    }
}

/// Info record through a [`LogSink`].
#[macro_export]
macro_rules! sink_info {
    ($sink:expr, $($arg:tt)*) => {
        $crate::utils::logging::LogSink::record(
            &*$sink,
            $crate::utils::logging::Level::Info,
            format_args!($($arg)*),
        )
    };
}

/// Warn record through a [`LogSink`].
#[macro_export]
macro_rules! sink_warn {
    ($sink:expr, $($arg:tt)*) => {
        $crate::utils::logging::LogSink::record(
            &*$sink,
            $crate::utils::logging::Level::Warn,
            format_args!($($arg)*),
        )
    };
}

/// Error record through a [`LogSink`].
#[macro_export]
macro_rules! sink_error {
    ($sink:expr, $($arg:tt)*) => {
        $crate::utils::logging::LogSink::record(
            &*$sink,
            $crate::utils::logging::Level::Error,
            format_args!($($arg)*),
        )
    };
}

#[macro_export]
macro_rules! sink_debug {
    ($sink:expr, $($arg:tt)*) => {
        $crate::utils::logging::LogSink::record(
            &*$sink,
            $crate::utils::logging::Level::Debug,
            format_args!($($arg)*),
        )
    };
}
