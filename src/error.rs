//! Typed failures and the fatal-error sink.

use std::sync::Mutex;

use thiserror::Error;

use crate::binlog::BinlogPosition;

/// Failures with domain meaning beyond "the write did not stick".
#[derive(Error, Debug)]
pub enum FerryError {
    /// Inline verification found rows whose fingerprints differ between
    /// source and target. Never retried: the batch was rolled back and the
    /// supervisor decides what to do.
    #[error("row fingerprints for pagination keys {pagination_keys:?} on {table} do not match")]
    Verification {
        table: String,
        pagination_keys: Vec<u64>,
    },

    /// The streamer delivered an event kind the applier has no handler for.
    #[error("unsupported replication event at {position}: {kind}")]
    UnsupportedEvent {
        kind: String,
        position: BinlogPosition,
    },

    /// A resume-state row for a table we know about failed to parse.
    #[error("corrupted resume state for {table}: {source}")]
    StateCorruption {
        table: String,
        #[source]
        source: serde_json::Error,
    },

    /// A cutover lock/unlock endpoint rejected us or was unreachable.
    #[error("cutover callback to {url} failed: {reason}")]
    Cutover { url: String, reason: String },
}

impl FerryError {
    /// Whether the bounded retry wrapper should try again on this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FerryError::Verification { .. })
    }
}

/// Sink for errors the appliers cannot recover from.
///
/// The binlog writer, batch writers, and the cutover coordinator report
/// retry-exhausted and protocol failures here instead of propagating them
/// further up.
pub trait ErrorHandler: Send + Sync {
    fn fatal(&self, component: &str, error: &anyhow::Error);
}

/// Logs the failure and terminates the process. Cleanup beyond what `Drop`
/// gives us is not attempted; a half-applied batch is invisible because each
/// batch commits atomically.
pub struct AbortingErrorHandler;

impl ErrorHandler for AbortingErrorHandler {
    fn fatal(&self, component: &str, error: &anyhow::Error) {
        tracing::error!(component, error = %error, "fatal error, aborting");
        std::process::exit(1);
    }
}

/// Records fatal errors instead of aborting. Used by tests and by embedders
/// that supervise the run themselves.
#[derive(Default)]
pub struct CollectingErrorHandler {
    errors: Mutex<Vec<String>>,
}

impl CollectingErrorHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.errors().is_empty()
    }
}

impl ErrorHandler for CollectingErrorHandler {
    fn fatal(&self, component: &str, error: &anyhow::Error) {
        tracing::error!(component, error = %error, "fatal error recorded");
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(format!("{component}: {error:#}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verification_is_not_retryable() {
        let err = FerryError::Verification {
            table: "db.users".to_string(),
            pagination_keys: vec![3, 9],
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("db.users"));
    }

    #[test]
    fn test_unsupported_event_is_retryable_shaped() {
        let err = FerryError::UnsupportedEvent {
            kind: "GtidEvent".to_string(),
            position: BinlogPosition::new("mysql-bin.00001", 4),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_collecting_handler_records() {
        let handler = CollectingErrorHandler::new();
        handler.fatal("binlog_writer", &anyhow::anyhow!("boom"));
        assert_eq!(handler.errors().len(), 1);
        assert!(handler.errors()[0].contains("binlog_writer"));
    }
}
