//! Per-query diagnostic message store
//!
//! Every user query accumulates `(code, severity, text)` records as it
//! executes. Failed queries surface these to the user; completed ones keep
//! informational entries for the process list and audit trail.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;

/// Message severity, deliberately coarse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Info,
    Error,
}

/// One diagnostic record.
#[derive(Debug, Clone, Serialize)]
pub struct QueryMessage {
    pub code: u32,
    pub severity: Severity,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Append-only message log for one user query.
#[derive(Default)]
pub struct MessageStore {
    messages: Mutex<Vec<QueryMessage>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&self, code: u32, text: impl Into<String>) {
        self.push(code, Severity::Info, text.into());
    }

    pub fn error(&self, code: u32, text: impl Into<String>) {
        self.push(code, Severity::Error, text.into());
    }

    fn push(&self, code: u32, severity: Severity, text: String) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(QueryMessage {
                code,
                severity,
                text,
                timestamp: Utc::now(),
            });
        }
    }

    pub fn snapshot(&self) -> Vec<QueryMessage> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn has_errors(&self) -> bool {
        self.messages
            .lock()
            .map(|m| m.iter().any(|msg| msg.severity == Severity::Error))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_accumulate_in_order() {
        let store = MessageStore::new();
        store.info(0, "dispatched 3 jobs");
        store.error(5, "job 2 timed out");
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].severity, Severity::Info);
        assert!(store.has_errors());
    }
}
