//! User query session object
//!
//! One [`UserQuery`] exists per submitted statement, from parse to result
//! release. It owns the message store and the state watch that
//! `await_completion` and the process list observe. Cancellation is a flag
//! plus a notify; the executor task honors it between events.

use chrono::{DateTime, Utc};
use skyshard_common::QueryId;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

use crate::session::messages::MessageStore;

/// Lifecycle of a user query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Unknown,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl QueryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(text: &str) -> Self {
        match text {
            "IN_PROGRESS" => Self::InProgress,
            "COMPLETED" => Self::Completed,
            "FAILED" => Self::Failed,
            "CANCELLED" => Self::Cancelled,
            _ => Self::Unknown,
        }
    }
}

/// Shared handle to one query's session state.
pub struct UserQuery {
    pub id: QueryId,
    pub sql: String,
    pub messages: MessageStore,
    pub submitted_at: DateTime<Utc>,
    state_tx: watch::Sender<QueryState>,
    state_rx: watch::Receiver<QueryState>,
    cancel_requested: AtomicBool,
    finished_at: Mutex<Option<DateTime<Utc>>>,
}

impl UserQuery {
    pub fn new(id: QueryId, sql: impl Into<String>) -> Self {
        let (state_tx, state_rx) = watch::channel(QueryState::InProgress);
        Self {
            id,
            sql: sql.into(),
            messages: MessageStore::new(),
            submitted_at: Utc::now(),
            state_tx,
            state_rx,
            cancel_requested: AtomicBool::new(false),
            finished_at: Mutex::new(None),
        }
    }

    pub fn state(&self) -> QueryState {
        *self.state_rx.borrow()
    }

    /// Transition the session state. Terminal states are sticky.
    pub fn set_state(&self, next: QueryState) {
        self.state_tx.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            *current = next;
            true
        });
        if next.is_terminal() {
            if let Ok(mut finished) = self.finished_at.lock() {
                finished.get_or_insert_with(Utc::now);
            }
        }
    }

    /// Request cancellation. Idempotent; the executor observes the flag.
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Wait until the query reaches a terminal state.
    pub async fn await_completion(&self) -> QueryState {
        let mut rx = self.state_rx.clone();
        loop {
            let current = *rx.borrow_and_update();
            if current.is_terminal() {
                return current;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    /// When the query reached a terminal state, if it has.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at.lock().ok().and_then(|f| *f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn terminal_states_are_sticky() {
        let query = UserQuery::new(QueryId(1), "SELECT 1");
        query.set_state(QueryState::Cancelled);
        query.set_state(QueryState::Completed);
        assert_eq!(query.state(), QueryState::Cancelled);
        assert!(query.finished_at().is_some());
    }

    #[tokio::test]
    async fn await_completion_sees_a_later_transition() {
        let query = std::sync::Arc::new(UserQuery::new(QueryId(2), "SELECT 1"));
        let waiter = std::sync::Arc::clone(&query);
        let handle = tokio::spawn(async move { waiter.await_completion().await });
        tokio::task::yield_now().await;
        query.set_state(QueryState::Completed);
        assert_eq!(handle.await.expect("join"), QueryState::Completed);
    }

    #[test]
    fn cancel_flag_is_idempotent() {
        let query = UserQuery::new(QueryId(3), "SELECT 1");
        assert!(!query.cancel_requested());
        query.request_cancel();
        query.request_cancel();
        assert!(query.cancel_requested());
    }
}
