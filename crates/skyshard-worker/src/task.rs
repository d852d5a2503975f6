//! Executable task, the worker-side mirror of a czar job

use skyshard_common::{AttemptCount, ChunkId, CzarId, JobId, QueryId};
use skyshard_proto::{TaskFragment, TaskMsg, TaskState};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::memman::MemHandle;
use crate::scan_info::ScanInfo;
use crate::send_channel::SendChannel;

/// Identity of a task within this worker: one `(query, job)` pair may have
/// at most one active task at a time, whatever its attempt counter says.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    pub query_id: QueryId,
    pub job_id: JobId,
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.query_id, self.job_id)
    }
}

/// One admitted unit of work: the chunk queries of a single job, plus the
/// scheduling and streaming context they run under.
pub struct Task {
    key: TaskKey,
    attempt: AttemptCount,
    czar_id: CzarId,
    db: String,
    chunk: ChunkId,
    interactive: bool,
    scan_info: ScanInfo,
    fragments: Vec<TaskFragment>,
    channel: Arc<SendChannel>,
    state: Mutex<TaskState>,
    cancelled: AtomicBool,
    cancel_notify: Notify,
    booted: AtomicU32,
    mem_handle: Mutex<Option<MemHandle>>,
}

impl Task {
    pub fn new(msg: &TaskMsg, channel: Arc<SendChannel>) -> Self {
        Self {
            key: TaskKey {
                query_id: msg.query_id,
                job_id: msg.job_id,
            },
            attempt: msg.attempt,
            czar_id: msg.czar_id,
            db: msg.db.clone(),
            chunk: msg.chunk,
            interactive: msg.scan_interactive,
            scan_info: ScanInfo::new(msg.scan_tables.clone()),
            fragments: msg.fragments.clone(),
            channel,
            state: Mutex::new(TaskState::Queued),
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
            booted: AtomicU32::new(0),
            mem_handle: Mutex::new(None),
        }
    }

    pub fn key(&self) -> TaskKey {
        self.key
    }

    pub fn attempt(&self) -> AttemptCount {
        self.attempt
    }

    pub fn czar_id(&self) -> CzarId {
        self.czar_id
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn chunk(&self) -> ChunkId {
        self.chunk
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    pub fn scan_info(&self) -> &ScanInfo {
        &self.scan_info
    }

    pub fn fragments(&self) -> &[TaskFragment] {
        &self.fragments
    }

    pub fn channel(&self) -> &Arc<SendChannel> {
        &self.channel
    }

    pub fn state(&self) -> TaskState {
        self.state.lock().map(|s| *s).unwrap_or(TaskState::Queued)
    }

    pub fn set_state(&self, next: TaskState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    /// Flag the task as cancelled and wake anything waiting on it. A running
    /// task notices between row batches; a queued one is skipped at
    /// admission. Idempotent.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.channel.kill();
            self.cancel_notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until the task is cancelled. Used with `select!` around
    /// suspension points.
    pub async fn cancelled_wait(&self) {
        if self.is_cancelled() {
            return;
        }
        self.cancel_notify.notified().await;
    }

    /// Record a scheduler boot. Returns the new total for this task.
    pub fn record_boot(&self) -> u32 {
        self.booted.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn take_mem_handle(&self) -> Option<MemHandle> {
        self.mem_handle.lock().ok().and_then(|mut h| h.take())
    }

    pub fn store_mem_handle(&self, handle: MemHandle) {
        if let Ok(mut slot) = self.mem_handle.lock() {
            *slot = Some(handle);
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("key", &self.key)
            .field("attempt", &self.attempt)
            .field("chunk", &self.chunk)
            .field("interactive", &self.interactive)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
