//! Destinations for the audit lines.
//!
//! The logger emits at most two lines per request, "received" and
//! "processed", both at info level. A [`LogSink`] receives each line together
//! with a snapshot of the diagnostic context taken when the line is emitted.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

/// Receives the audit lines of every request.
///
/// # Examples
///
/// ```rust
/// use logged_http::LogSink;
/// use std::collections::BTreeMap;
///
/// struct Stdout;
///
/// impl LogSink for Stdout {
///     fn info(&self, line: &str, context: &BTreeMap<String, String>) {
///         println!("{line} {context:?}");
///     }
/// }
/// ```
pub trait LogSink: Send + Sync + 'static {
    fn info(&self, line: &str, context: &BTreeMap<String, String>);
}

/// Emits lines as `tracing` events, with the context as a JSON object field.
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn info(&self, line: &str, context: &BTreeMap<String, String>) {
        let context = serde_json::to_string(context).unwrap_or_default();
        info!(target: "logged_http", context = %context, "{}", line);
    }
}

/// One emitted line and the context it was emitted with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub line: String,
    pub context: BTreeMap<String, String>,
}

/// Keeps every line in memory.
///
/// Cloning shares the records, so a clone can be handed to the logger and
/// the other one inspected afterwards.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.records().into_iter().map(|record| record.line).collect()
    }
}

impl LogSink for MemorySink {
    fn info(&self, line: &str, context: &BTreeMap<String, String>) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(LogRecord {
                line: line.to_string(),
                context: context.clone(),
            });
    }
}

/// Forwards every line to several sinks, in order.
///
/// ```rust
/// use logged_http::{MemorySink, MultiSink, TracingSink};
///
/// let sink = MultiSink::new().with(TracingSink).with(MemorySink::new());
/// assert_eq!(sink.len(), 2);
/// ```
#[derive(Clone, Default)]
pub struct MultiSink {
    sinks: Vec<Arc<dyn LogSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<S: LogSink>(mut self, sink: S) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl LogSink for MultiSink {
    fn info(&self, line: &str, context: &BTreeMap<String, String>) {
        for sink in &self.sinks {
            sink.info(line, context);
        }
    }
}

impl fmt::Debug for MultiSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_records_context() {
        let sink = MemorySink::new();
        let context = BTreeMap::from([("request-id".to_string(), "abc".to_string())]);

        sink.clone().info("Received GET /", &context);

        assert_eq!(
            sink.records(),
            vec![LogRecord {
                line: "Received GET /".to_string(),
                context,
            }]
        );
    }

    #[test]
    fn test_multi_sink_fans_out() {
        let first = MemorySink::new();
        let second = MemorySink::new();
        let sink = MultiSink::new()
            .with(first.clone())
            .with(TracingSink)
            .with(second.clone());

        sink.info("Processed GET / with status 200 in 1ms", &BTreeMap::new());

        assert_eq!(first.lines().len(), 1);
        assert_eq!(first.lines(), second.lines());
        assert!(!sink.is_empty());
    }
}
