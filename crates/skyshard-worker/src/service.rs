//! Worker service context
//!
//! All shared mutable state of a worker process lives here: the chunk
//! ownership set, the live task registry, the scheduler, the memory manager
//! and the reply budget. The context is created once at startup and passed
//! explicitly to every component; there are no process-wide singletons.

use dashmap::DashMap;
use skyshard_common::{ChunkId, QueryId};
use skyshard_config::WorkerConfig;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{WorkerError, WorkerResult};
use crate::memman::MemMan;
use crate::runner::QueryRunner;
use crate::sched::WorkerScheduler;
use crate::send_channel::ReplyBudget;
use crate::task::{Task, TaskKey};

/// Outcome of registering a task, telling the dispatcher how to reply.
#[derive(Debug)]
pub enum Registration {
    /// New task accepted and ready to queue.
    Accepted,
    /// Same `(query, job, attempt)` already active; reject silently upward.
    Duplicate,
    /// An older attempt was still active; it has been cancelled, and the
    /// czar should retry once it drains.
    PreviousAttemptCancelled,
}

/// Shared state of one worker process.
pub struct ServiceContext {
    pub config: WorkerConfig,
    pub scheduler: Arc<WorkerScheduler>,
    pub memman: Arc<MemMan>,
    pub budget: Arc<ReplyBudget>,
    pub runner: Arc<dyn QueryRunner>,
    /// `(db, chunk)` pairs this worker serves.
    ownership: DashMap<(String, u32), ()>,
    /// Live tasks by `(query, job)`.
    tasks: DashMap<TaskKey, Arc<Task>>,
}

impl ServiceContext {
    pub fn new(config: WorkerConfig, runner: Arc<dyn QueryRunner>) -> Arc<Self> {
        let memman = Arc::new(MemMan::new(&config.memman));
        let scheduler = Arc::new(WorkerScheduler::new(&config.scheduler, Arc::clone(&memman)));
        let budget = Arc::new(ReplyBudget::new(config.reply.max_reply_buffer_bytes()));
        Arc::new(Self {
            config,
            scheduler,
            memman,
            budget,
            runner,
            ownership: DashMap::new(),
            tasks: DashMap::new(),
        })
    }

    pub fn owns(&self, db: &str, chunk: ChunkId) -> bool {
        self.ownership.contains_key(&(db.to_string(), chunk.0))
    }

    pub fn add_chunk(&self, db: &str, chunk: ChunkId) {
        info!(db, chunk = chunk.0, "chunk added to inventory");
        self.ownership.insert((db.to_string(), chunk.0), ());
    }

    pub fn remove_chunk(&self, db: &str, chunk: ChunkId) {
        info!(db, chunk = chunk.0, "chunk removed from inventory");
        self.ownership.remove(&(db.to_string(), chunk.0));
    }

    /// Sorted inventory listing for the admin surface.
    pub fn list_chunks(&self) -> Vec<(String, u32)> {
        let mut chunks: Vec<(String, u32)> = self
            .ownership
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        chunks.sort();
        chunks
    }

    /// Register a task under the at-most-one-active rule for its
    /// `(query, job)` key.
    pub fn register_task(&self, task: &Arc<Task>) -> Registration {
        let key = task.key();
        if let Some(existing) = self.tasks.get(&key) {
            if existing.attempt() >= task.attempt() {
                warn!(task = %key, attempt = task.attempt(), "duplicate dispatch rejected");
                return Registration::Duplicate;
            }
            // A newer attempt supersedes a straggler from a czar retry that
            // raced a lagging reply. Cancel it; the retry lands later.
            warn!(
                task = %key,
                old_attempt = existing.attempt(),
                new_attempt = task.attempt(),
                "cancelling superseded attempt"
            );
            existing.cancel();
            return Registration::PreviousAttemptCancelled;
        }
        self.tasks.insert(key, Arc::clone(task));
        Registration::Accepted
    }

    pub fn task(&self, key: &TaskKey) -> Option<Arc<Task>> {
        self.tasks.get(key).map(|entry| Arc::clone(&entry))
    }

    /// Flag one task cancelled. Idempotent; unknown keys are ignored (the
    /// task may have finished and unregistered already).
    pub fn cancel_task(&self, key: &TaskKey) {
        if let Some(task) = self.task(key) {
            debug!(task = %key, "cancel received");
            task.cancel();
        }
    }

    /// Cancel every live task of a user query.
    pub fn cancel_query(&self, query_id: QueryId) {
        for entry in self.tasks.iter() {
            if entry.key().query_id == query_id {
                entry.value().cancel();
            }
        }
    }

    /// Remove a finished task and release its scheduler slot.
    pub fn finish_task(&self, task: &Arc<Task>) {
        self.tasks.remove(&task.key());
        self.scheduler.task_complete(task);
    }

    /// Fail fast when the worker does not serve the claimed chunk.
    pub fn check_ownership(&self, db: &str, chunk: ChunkId) -> WorkerResult<()> {
        if self.owns(db, chunk) {
            Ok(())
        } else {
            Err(WorkerError::ResourceMismatch {
                db: db.to_string(),
                chunk: chunk.0,
            })
        }
    }
}
