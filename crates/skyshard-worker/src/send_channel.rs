//! Reply streaming back to the czar
//!
//! Each task owns a [`SendChannel`] that serializes its reply stream onto
//! the shared connection writer. Blob bytes count against a global budget;
//! a producer blocks (yielding its pool thread) until budget frees up or the
//! task is cancelled. The budget permit travels with the outbound frame and
//! is released only once the frame has been written to the socket, so the
//! in-flight byte total can never exceed the cap.

use bytes::Bytes;
use skyshard_common::{AttemptCount, JobId, QueryId};
use skyshard_proto::{ErrorMsg, Message, ReplyBlob, ReplyHeader, StatusMsg, TaskState, WireErrorCode};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::mpsc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::error::{WorkerError, WorkerResult};

/// A frame queued for the connection writer. Dropping it (after the write)
/// releases any reply-buffer budget it held.
pub struct Outbound {
    pub message: Message,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Outbound {
    pub fn control(message: Message) -> Self {
        Self {
            message,
            _permit: None,
        }
    }
}

/// Global cap on reply bytes buffered across every send channel of this
/// worker. One permit is one byte.
pub struct ReplyBudget {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ReplyBudget {
    pub fn new(capacity_bytes: u64) -> Self {
        let capacity = usize::try_from(capacity_bytes)
            .unwrap_or(usize::MAX)
            .min(Semaphore::MAX_PERMITS);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently available before producers block.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Reserve `bytes` of budget, waiting as long as it takes. A blob larger
    /// than the whole budget is clamped: it will be the only blob in flight.
    async fn reserve(&self, bytes: usize) -> WorkerResult<OwnedSemaphorePermit> {
        let want = bytes.min(self.capacity).max(1);
        let want = u32::try_from(want).unwrap_or(u32::MAX);
        Arc::clone(&self.semaphore)
            .acquire_many_owned(want)
            .await
            .map_err(|_| WorkerError::ChannelDead)
    }
}

/// Per-task reply stream with last-flag and kill semantics.
pub struct SendChannel {
    query_id: QueryId,
    job_id: JobId,
    attempt: AttemptCount,
    out: mpsc::Sender<Outbound>,
    budget: Arc<ReplyBudget>,
    seq: AtomicU32,
    finished: AtomicBool,
    dead: AtomicBool,
}

impl SendChannel {
    pub fn new(
        query_id: QueryId,
        job_id: JobId,
        attempt: AttemptCount,
        out: mpsc::Sender<Outbound>,
        budget: Arc<ReplyBudget>,
    ) -> Self {
        Self {
            query_id,
            job_id,
            attempt,
            out,
            budget,
            seq: AtomicU32::new(0),
            finished: AtomicBool::new(false),
            dead: AtomicBool::new(false),
        }
    }

    pub fn attempt(&self) -> AttemptCount {
        self.attempt
    }

    fn check_alive(&self) -> WorkerResult<()> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(WorkerError::ChannelDead);
        }
        Ok(())
    }

    /// Open the stream with its header frame.
    pub async fn send_header(&self, header: ReplyHeader) -> WorkerResult<()> {
        self.check_alive()?;
        self.out
            .send(Outbound::control(Message::ReplyHeader(header)))
            .await
            .map_err(|_| WorkerError::ChannelDead)
    }

    /// Stream one blob. Blocks while the global reply budget is exhausted.
    /// After a `last=true` blob is accepted, any further send fails.
    pub async fn send(&self, payload: Bytes, last: bool) -> WorkerResult<()> {
        self.check_alive()?;
        if self.finished.load(Ordering::SeqCst) {
            return Err(WorkerError::StreamFinished);
        }
        let permit = self.budget.reserve(payload.len()).await?;
        // Re-check: the channel may have been killed while we waited.
        self.check_alive()?;
        if last {
            self.finished.store(true, Ordering::SeqCst);
        }
        let blob = ReplyBlob {
            query_id: self.query_id,
            job_id: self.job_id,
            attempt: self.attempt,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            last,
            payload,
        };
        self.out
            .send(Outbound {
                message: Message::ReplyBlob(blob),
                _permit: Some(permit),
            })
            .await
            .map_err(|_| WorkerError::ChannelDead)
    }

    /// Report task progress to the czar. Status frames bypass the blob
    /// budget.
    pub async fn send_status(&self, state: TaskState) -> WorkerResult<()> {
        self.check_alive()?;
        let msg = StatusMsg {
            query_id: self.query_id,
            job_id: self.job_id,
            state,
            extended: String::new(),
        };
        self.out
            .send(Outbound::control(Message::Status(msg)))
            .await
            .map_err(|_| WorkerError::ChannelDead)
    }

    /// Report a failure instead of (or after part of) a result stream.
    /// Error frames are small and bypass the blob budget.
    pub async fn send_error(&self, code: WireErrorCode, text: impl Into<String>) -> WorkerResult<()> {
        self.check_alive()?;
        let msg = ErrorMsg {
            query_id: self.query_id,
            job_id: self.job_id,
            code,
            text: text.into(),
        };
        self.out
            .send(Outbound::control(Message::Error(msg)))
            .await
            .map_err(|_| WorkerError::ChannelDead)
    }

    /// Kill the channel: all subsequent sends fail. Returns the previous
    /// dead state, making double kills detectable and harmless.
    pub fn kill(&self) -> bool {
        let was_dead = self.dead.swap(true, Ordering::SeqCst);
        if !was_dead {
            debug!(query_id = %self.query_id, job_id = %self.job_id, "send channel killed");
        }
        was_dead
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }
}

/// Fan-in channel for tasks that share one reply stream (subchunk fragments
/// executed in parallel). Each writer announces its own `last`; only the
/// final one closes the underlying stream.
pub struct SharedSendChannel {
    inner: Arc<SendChannel>,
    remaining_last: AtomicU32,
}

impl SharedSendChannel {
    pub fn new(inner: Arc<SendChannel>, expected_writers: u32) -> Self {
        Self {
            inner,
            remaining_last: AtomicU32::new(expected_writers.max(1)),
        }
    }

    pub fn inner(&self) -> &Arc<SendChannel> {
        &self.inner
    }

    /// Forward a blob, demoting `last` until the final expected writer
    /// finishes.
    pub async fn send(&self, payload: Bytes, last: bool) -> WorkerResult<()> {
        if !last {
            return self.inner.send(payload, false).await;
        }
        let remaining = self
            .remaining_last
            .fetch_sub(1, Ordering::SeqCst)
            .saturating_sub(1);
        if remaining == 0 {
            self.inner.send(payload, true).await
        } else {
            debug!(remaining, "intermediate last flag absorbed");
            self.inner.send(payload, false).await
        }
    }
}

/// Convenience used by error paths that must not await channel capacity.
pub fn try_send_control(out: &mpsc::Sender<Outbound>, message: Message) {
    if let Err(err) = out.try_send(Outbound::control(message)) {
        warn!(error = %err, "dropping control frame: writer queue full or closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(budget_bytes: u64) -> (Arc<SendChannel>, mpsc::Receiver<Outbound>, Arc<ReplyBudget>) {
        let (tx, rx) = mpsc::channel(64);
        let budget = Arc::new(ReplyBudget::new(budget_bytes));
        let ch = Arc::new(SendChannel::new(
            QueryId(1),
            JobId(0),
            1,
            tx,
            Arc::clone(&budget),
        ));
        (ch, rx, budget)
    }

    #[tokio::test]
    async fn no_send_succeeds_after_last() {
        let (ch, _rx, _budget) = channel(1024);
        ch.send(Bytes::from_static(b"rows"), true).await.expect("last accepted");
        let err = ch.send(Bytes::from_static(b"more"), false).await.unwrap_err();
        assert!(matches!(err, WorkerError::StreamFinished));
    }

    #[tokio::test]
    async fn kill_is_idempotent_and_fails_sends() {
        let (ch, _rx, _budget) = channel(1024);
        assert!(!ch.kill(), "first kill sees a live channel");
        assert!(ch.kill(), "second kill sees a dead one");
        let err = ch.send(Bytes::from_static(b"x"), false).await.unwrap_err();
        assert!(matches!(err, WorkerError::ChannelDead));
    }

    #[tokio::test]
    async fn budget_blocks_until_frames_are_written() {
        let (ch, mut rx, budget) = channel(8);
        ch.send(Bytes::from_static(b"12345678"), false)
            .await
            .expect("fits exactly");
        assert_eq!(budget.available(), 0);

        // Second send cannot proceed while the first frame is unwritten.
        let ch2 = Arc::clone(&ch);
        let pending = tokio::spawn(async move { ch2.send(Bytes::from_static(b"abcd"), true).await });
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        // "Write" the first frame; dropping it releases its budget.
        let first = rx.recv().await.expect("first frame");
        drop(first);

        pending.await.expect("join").expect("second send completes");
        let second = rx.recv().await.expect("second frame");
        drop(second);
        assert_eq!(budget.available(), 8);
    }

    #[tokio::test]
    async fn shared_channel_closes_on_final_last_only() {
        let (ch, mut rx, _budget) = channel(1024);
        let shared = SharedSendChannel::new(Arc::clone(&ch), 2);

        shared.send(Bytes::from_static(b"a"), true).await.expect("writer 1");
        shared.send(Bytes::from_static(b"b"), true).await.expect("writer 2");

        let first = rx.recv().await.expect("frame 1");
        let Message::ReplyBlob(b1) = first.message else {
            panic!("expected blob");
        };
        assert!(!b1.last, "intermediate last demoted");

        let second = rx.recv().await.expect("frame 2");
        let Message::ReplyBlob(b2) = second.message else {
            panic!("expected blob");
        };
        assert!(b2.last, "final last preserved");
    }

    #[tokio::test]
    async fn oversized_blob_is_clamped_to_the_whole_budget() {
        let (ch, mut rx, budget) = channel(4);
        ch.send(Bytes::from_static(b"longer-than-budget"), true)
            .await
            .expect("clamped reservation still sends");
        assert_eq!(budget.available(), 0);
        drop(rx.recv().await);
        assert_eq!(budget.available(), 4);
    }
}
