//! Injected logging capability
//!
//! Components receive a [`Logger`] explicitly instead of reaching for a
//! process-wide hook. Swapping the sink changes where messages go; it never
//! changes control flow.

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

/// Severity of a log message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Only emitted when the logger is verbose
    Debug,
    Info,
    /// Something on a host was modified
    Changed,
    Warn,
    Error,
}

/// Destination for log messages
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

/// Forwards to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => debug!("{message}"),
            LogLevel::Info => info!("{message}"),
            LogLevel::Changed => info!(changed = true, "{message}"),
            LogLevel::Warn => warn!("{message}"),
            LogLevel::Error => error!("{message}"),
        }
    }
}

/// Keeps messages in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<(LogLevel, String)>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything logged so far
    #[must_use]
    pub fn entries(&self) -> Vec<(LogLevel, String)> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Messages logged at `level`
    #[must_use]
    pub fn messages_at(&self, level: LogLevel) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, message)| message)
            .collect()
    }
}

impl LogSink for MemorySink {
    fn log(&self, level: LogLevel, message: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push((level, message.to_string()));
        }
    }
}

/// Leveled logging facade with a verbosity flag
#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn LogSink>,
    verbose: bool,
}

impl Logger {
    pub fn new(sink: Arc<dyn LogSink>, verbose: bool) -> Self {
        Self { sink, verbose }
    }

    /// Logger backed by `tracing`
    #[must_use]
    pub fn tracing(verbose: bool) -> Self {
        Self::new(Arc::new(TracingSink), verbose)
    }

    #[must_use]
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Copy of this logger with a different verbosity
    #[must_use]
    pub fn with_verbose(&self, verbose: bool) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            verbose,
        }
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        if self.verbose {
            self.sink.log(LogLevel::Debug, message.as_ref());
        }
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.sink.log(LogLevel::Info, message.as_ref());
    }

    pub fn changed(&self, message: impl AsRef<str>) {
        self.sink.log(LogLevel::Changed, message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.sink.log(LogLevel::Warn, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.sink.log(LogLevel::Error, message.as_ref());
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::tracing(false)
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("verbose", &self.verbose)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_requires_verbose() {
        let sink = Arc::new(MemorySink::new());
        let quiet = Logger::new(sink.clone(), false);
        assert!(!quiet.is_verbose());
        assert!(quiet.with_verbose(true).is_verbose());

        quiet.debug("hidden");
        quiet.info("shown");
        assert_eq!(sink.entries(), vec![(LogLevel::Info, "shown".to_string())]);

        quiet.with_verbose(true).debug("now visible");
        assert_eq!(sink.messages_at(LogLevel::Debug), vec!["now visible"]);
    }

    #[test]
    fn test_levels_reach_sink() {
        let sink = Arc::new(MemorySink::new());
        let logger = Logger::new(sink.clone(), true);

        logger.changed("installed kubectl");
        logger.warn("slow host");
        logger.error("gave up");

        let levels: Vec<LogLevel> = sink.entries().into_iter().map(|(l, _)| l).collect();
        assert_eq!(levels, vec![LogLevel::Changed, LogLevel::Warn, LogLevel::Error]);
    }
}
