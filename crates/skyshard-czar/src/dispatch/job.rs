//! Job state machine
//!
//! A job is one `(user query, chunk)` pair. Its state advances strictly
//! forward, with one sanctioned back-edge: a retryable failure requeues the
//! job with an incremented attempt counter, bounded by the configured
//! attempt limit. Exactly one attempt is ever in flight.

use skyshard_catalog::WorkerRef;
use skyshard_common::{AttemptCount, ChunkId, JobId};
use std::time::Instant;
use tracing::warn;

/// Lifecycle of one job on the czar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Dispatched,
    Running,
    Streaming,
    Done,
    RetryableFail,
    FatalFail,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::FatalFail | Self::Cancelled)
    }

    /// Monotonic rank; the retry back-edge is validated separately.
    fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Dispatched => 1,
            Self::Running => 2,
            Self::Streaming => 3,
            Self::Done | Self::RetryableFail | Self::FatalFail | Self::Cancelled => 4,
        }
    }
}

/// One job and its dispatch bookkeeping.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: JobId,
    pub chunk: ChunkId,
    pub attempt: AttemptCount,
    pub state: JobState,
    pub worker: Option<WorkerRef>,
    pub dispatched_at: Option<Instant>,
    pub created_at: Instant,
}

impl Job {
    pub fn new(job_id: JobId, chunk: ChunkId) -> Self {
        Self {
            job_id,
            chunk,
            attempt: 1,
            state: JobState::Queued,
            worker: None,
            dispatched_at: None,
            created_at: Instant::now(),
        }
    }

    /// Advance the state machine. Regressions and transitions out of a
    /// terminal state are ignored with a warning; stale worker messages
    /// arriving after completion must not resurrect a job.
    pub fn advance(&mut self, next: JobState) {
        if self.state.is_terminal() {
            warn!(job = %self.job_id, from = ?self.state, to = ?next, "ignoring transition out of terminal state");
            return;
        }
        if next.rank() < self.state.rank() {
            warn!(job = %self.job_id, from = ?self.state, to = ?next, "ignoring backwards transition");
            return;
        }
        self.state = next;
        if next == JobState::Dispatched {
            self.dispatched_at = Some(Instant::now());
        }
    }

    /// The single sanctioned back-edge: requeue after a retryable failure.
    /// Returns false when the attempt budget is exhausted.
    pub fn requeue(&mut self, max_attempts: u32) -> bool {
        if self.attempt >= max_attempts {
            return false;
        }
        self.attempt += 1;
        self.state = JobState::Queued;
        self.worker = None;
        self.dispatched_at = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_is_strictly_forward() {
        let mut job = Job::new(JobId(0), ChunkId(100));
        job.advance(JobState::Dispatched);
        job.advance(JobState::Running);
        job.advance(JobState::Streaming);
        job.advance(JobState::Done);
        assert_eq!(job.state, JobState::Done);

        // Stale messages cannot move a finished job.
        job.advance(JobState::Running);
        assert_eq!(job.state, JobState::Done);
    }

    #[test]
    fn backwards_transitions_are_ignored() {
        let mut job = Job::new(JobId(0), ChunkId(100));
        job.advance(JobState::Streaming);
        job.advance(JobState::Dispatched);
        assert_eq!(job.state, JobState::Streaming);
    }

    #[test]
    fn requeue_is_bounded_by_max_attempts() {
        let mut job = Job::new(JobId(0), ChunkId(100));
        job.advance(JobState::Dispatched);
        job.advance(JobState::RetryableFail);

        assert!(job.requeue(3));
        assert_eq!(job.attempt, 2);
        assert_eq!(job.state, JobState::Queued);

        job.advance(JobState::RetryableFail);
        assert!(job.requeue(3));
        assert_eq!(job.attempt, 3);

        job.advance(JobState::RetryableFail);
        assert!(!job.requeue(3), "third attempt exhausts the budget");
    }
}
