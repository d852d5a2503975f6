//! Per-query execution engine
//!
//! One executor task drives a user query from dispatch to terminal state as
//! a state machine over its jobs, advanced by worker events and a timeout
//! tick. Ordering within a reply stream is the transport's problem; this
//! loop owns retry policy, cancellation propagation and the final merge.

use skyshard_catalog::{ChunkCatalog, WorkerRef};
use skyshard_common::{ChunkId, CzarId, JobId, QueryId, SubchunkId};
use skyshard_config::DispatchConfig;
use skyshard_proto::{
    CancelMsg, Message, TaskFragment, TaskMsg, TaskState, WireErrorCode,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::analysis::{ChunkingPlan, QuerySpec};
use crate::dispatch::job::{Job, JobState};
use crate::error::{CzarError, CzarResult};
use crate::merge::{MergeOutcome, ResultMerger};
use crate::metadata::QueryMetadataStore;
use crate::results::ResultStore;
use crate::session::{QueryState, UserQuery};
use crate::transport::{WorkerChannelPool, WorkerEvent};

/// Queries touching at most this many chunks bypass the shared-scan
/// machinery on workers.
const INTERACTIVE_CHUNK_LIMIT: usize = 16;

const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Czar services shared by every query executor.
pub struct ExecContext {
    pub czar_id: CzarId,
    pub dispatch: DispatchConfig,
    pub catalog: Arc<dyn ChunkCatalog>,
    pub store: Arc<dyn ResultStore>,
    pub metadata: Arc<dyn QueryMetadataStore>,
    pub transport: Arc<WorkerChannelPool>,
}

/// Drives one user query to a terminal state.
pub struct QueryExecutor {
    ctx: Arc<ExecContext>,
    user_query: Arc<UserQuery>,
    spec: QuerySpec,
    events: mpsc::Receiver<WorkerEvent>,
    jobs: HashMap<JobId, Job>,
    merger: ResultMerger,
    subchunks: Vec<SubchunkId>,
    interactive: bool,
    /// Jobs requeued by a retryable failure, dispatched on the next tick so
    /// a racing previous attempt has time to drain.
    pending_redispatch: Vec<JobId>,
}

impl QueryExecutor {
    pub fn new(
        ctx: Arc<ExecContext>,
        user_query: Arc<UserQuery>,
        spec: QuerySpec,
        events: mpsc::Receiver<WorkerEvent>,
    ) -> Self {
        let merger = ResultMerger::new(
            user_query.id,
            spec.result_columns.clone(),
            Arc::clone(&ctx.store),
        );
        Self {
            ctx,
            user_query,
            spec,
            events,
            jobs: HashMap::new(),
            merger,
            subchunks: Vec::new(),
            interactive: false,
            pending_redispatch: Vec::new(),
        }
    }

    fn query_id(&self) -> QueryId {
        self.user_query.id
    }

    /// Run to a terminal state. Consumes the executor.
    pub async fn run(mut self) {
        if let Err(err) = self.execute().await {
            self.fail_query(&err).await;
        }
    }

    async fn execute(&mut self) -> CzarResult<()> {
        self.merger.begin().await?;

        if self.spec.plan == ChunkingPlan::None {
            // Unpartitioned statement: no dispatch, the statement itself
            // produces the result table at the czar.
            self.ctx
                .store
                .run_local(self.query_id(), &self.spec.original_sql)
                .await?;
            self.finish(QueryState::Completed).await;
            return Ok(());
        }

        let chunks = self.chunk_set().await?;
        if chunks.is_empty() {
            // Still run the merge statement so the result table exists.
            info!(query_id = %self.query_id(), "empty chunk set, completing with zero rows");
            self.merger.finalize(&self.spec.merge).await?;
            self.finish(QueryState::Completed).await;
            return Ok(());
        }

        self.interactive = chunks.len() <= INTERACTIVE_CHUNK_LIMIT;
        if self.spec.plan == ChunkingPlan::ChunkAndSubchunk {
            if let Some(family) = self.spec.family {
                self.subchunks = self.ctx.catalog.subchunks(family).await?;
            }
        }

        for (index, chunk) in chunks.iter().enumerate() {
            let job_id = JobId(index as u32);
            self.jobs.insert(job_id, Job::new(job_id, *chunk));
        }
        self.user_query
            .messages
            .info(0, format!("dispatching {} chunk jobs", self.jobs.len()));

        let job_ids: Vec<JobId> = {
            let mut ids: Vec<JobId> = self.jobs.keys().copied().collect();
            ids.sort();
            ids
        };
        for job_id in job_ids {
            self.dispatch_job(job_id).await?;
        }

        self.event_loop().await
    }

    /// The chunk set: the catalog's population pruned by every restrictor
    /// region.
    async fn chunk_set(&self) -> CzarResult<Vec<ChunkId>> {
        let db = self
            .spec
            .dispatch_db
            .clone()
            .ok_or_else(|| CzarError::Internal("chunked plan without dispatch db".to_string()))?;
        let family = self
            .spec
            .family
            .ok_or_else(|| CzarError::Internal("chunked plan without family".to_string()))?;
        let mut chunks = self
            .ctx
            .catalog
            .chunks(&db, family, self.spec.regions.first())
            .await?;
        if self.spec.regions.len() > 1 {
            let geometry = self.ctx.catalog.geometry(family).await?;
            for region in &self.spec.regions[1..] {
                chunks.retain(|c| geometry.intersects(*c, region));
            }
        }
        Ok(chunks)
    }

    async fn event_loop(&mut self) -> CzarResult<()> {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else {
                        return Err(CzarError::Internal("event channel closed".to_string()));
                    };
                    if self.handle_event(event).await? {
                        return Ok(());
                    }
                }
                _ = tick.tick() => {
                    if self.user_query.cancel_requested() {
                        self.cancel_query().await;
                        return Ok(());
                    }
                    let pending = std::mem::take(&mut self.pending_redispatch);
                    for job_id in pending {
                        self.dispatch_job(job_id).await?;
                    }
                    if self.check_timeouts().await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Returns true when the query reached a terminal state.
    async fn handle_event(&mut self, event: WorkerEvent) -> CzarResult<bool> {
        match event {
            WorkerEvent::Status(status) => {
                if let Some(job) = self.jobs.get_mut(&status.job_id) {
                    match status.state {
                        TaskState::Queued => {}
                        TaskState::InProgress => job.advance(JobState::Running),
                        TaskState::Streaming => job.advance(JobState::Streaming),
                        TaskState::Complete | TaskState::Cancelled => {}
                    }
                }
                Ok(false)
            }
            WorkerEvent::Header(header) => {
                let job_id = header.job_id;
                let attempt = header.attempt;
                match self.merger.on_header(header).await {
                    Ok(MergeOutcome::JobComplete) => self.complete_job(job_id).await,
                    Ok(_) => {
                        if let Some(job) = self.jobs.get_mut(&job_id) {
                            job.advance(JobState::Streaming);
                        }
                        Ok(false)
                    }
                    Err(err) if err.is_retryable() => self.fail_job(job_id, attempt, &err).await,
                    Err(err) => Err(err),
                }
            }
            WorkerEvent::Blob(blob) => {
                let job_id = blob.job_id;
                let attempt = blob.attempt;
                match self.merger.on_blob(blob).await {
                    Ok(MergeOutcome::JobComplete) => self.complete_job(job_id).await,
                    Ok(_) => Ok(false),
                    Err(err) if err.is_retryable() => self.fail_job(job_id, attempt, &err).await,
                    Err(err) => Err(err),
                }
            }
            WorkerEvent::Error(error) => {
                let job_id = error.job_id;
                debug!(query_id = %self.query_id(), job = %job_id, code = ?error.code, "worker error");
                let retryable = error.code.is_retryable()
                    || error.code == WireErrorCode::ResourceMismatch;
                if retryable {
                    let attempt = self.jobs.get(&job_id).map_or(1, |j| j.attempt);
                    let err = CzarError::Transport(error.text);
                    self.fail_job(job_id, attempt, &err).await
                } else if error.code == WireErrorCode::Cancelled {
                    Ok(false)
                } else {
                    Err(CzarError::Internal(format!(
                        "worker reported fatal error for job {job_id}: {}",
                        error.text
                    )))
                }
            }
            WorkerEvent::ChannelClosed { addr } => {
                let affected: Vec<(JobId, u32)> = self
                    .jobs
                    .values()
                    .filter(|job| {
                        !job.state.is_terminal()
                            && job.state != JobState::Queued
                            && job.worker.as_ref().is_some_and(|w| w.addr() == addr)
                    })
                    .map(|job| (job.job_id, job.attempt))
                    .collect();
                for (job_id, attempt) in affected {
                    let err = CzarError::Transport(format!("worker channel {addr} closed"));
                    if self.fail_job(job_id, attempt, &err).await? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    async fn dispatch_job(&mut self, job_id: JobId) -> CzarResult<()> {
        let (chunk, attempt) = {
            let Some(job) = self.jobs.get(&job_id) else {
                return Ok(());
            };
            (job.chunk, job.attempt)
        };
        let db = self
            .spec
            .dispatch_db
            .clone()
            .ok_or_else(|| CzarError::Internal("dispatch without db".to_string()))?;

        let worker = match self.ctx.catalog.worker_for(&db, chunk).await {
            Ok(worker) => worker,
            Err(err) => {
                // A chunk with no replica cannot be retried into existence.
                return Err(CzarError::Catalog(err));
            }
        };

        let message = Message::Task(self.task_msg(job_id, chunk, attempt, &db));
        {
            let Some(job) = self.jobs.get_mut(&job_id) else {
                return Ok(());
            };
            job.worker = Some(worker.clone());
            job.advance(JobState::Dispatched);
        }
        debug!(query_id = %self.query_id(), job = %job_id, chunk = %chunk, attempt, worker = worker.name, "dispatching job");

        if let Err(err) = self.ctx.transport.send(&worker.addr(), message).await {
            warn!(query_id = %self.query_id(), job = %job_id, error = %err, "dispatch failed");
            let _ = self.fail_job(job_id, attempt, &err).await?;
        }
        Ok(())
    }

    fn task_msg(&self, job_id: JobId, chunk: ChunkId, attempt: u32, db: &str) -> TaskMsg {
        let mut queries = vec![self.spec.template.render(chunk)];
        if let Some(overlap) = &self.spec.overlap_template {
            queries.push(overlap.render(chunk));
        }
        TaskMsg {
            query_id: self.query_id(),
            job_id,
            attempt,
            czar_id: self.ctx.czar_id,
            db: db.to_string(),
            chunk,
            scan_interactive: self.interactive,
            scan_tables: self.spec.scan_tables.clone(),
            fragments: vec![TaskFragment {
                queries,
                subchunks: self.subchunks.clone(),
                result_table: self.query_id().result_table(),
            }],
        }
    }

    /// Retryable failure of one job attempt. Returns true when this ended
    /// the whole query.
    async fn fail_job(
        &mut self,
        job_id: JobId,
        attempt: u32,
        err: &CzarError,
    ) -> CzarResult<bool> {
        self.merger.fail_attempt(job_id, attempt).await?;
        let exhausted = {
            let Some(job) = self.jobs.get_mut(&job_id) else {
                return Ok(false);
            };
            if job.state.is_terminal() || job.attempt != attempt {
                return Ok(false); // stale failure for a superseded attempt
            }
            job.advance(JobState::RetryableFail);
            !job.requeue(self.ctx.dispatch.max_attempts)
        };
        if exhausted {
            warn!(query_id = %self.query_id(), job = %job_id, "attempt budget exhausted");
            if let Some(job) = self.jobs.get_mut(&job_id) {
                job.state = JobState::FatalFail;
            }
            return Err(CzarError::Internal(format!(
                "job {job_id} failed after {} attempts: {err}",
                self.ctx.dispatch.max_attempts
            )));
        }
        self.user_query
            .messages
            .info(err.code(), format!("retrying job {job_id}: {err}"));
        self.pending_redispatch.push(job_id);
        Ok(false)
    }

    /// Mark a job merged and finish the query when it was the last one.
    async fn complete_job(&mut self, job_id: JobId) -> CzarResult<bool> {
        let (chunk, attempt) = {
            let Some(job) = self.jobs.get_mut(&job_id) else {
                return Ok(false);
            };
            job.advance(JobState::Done);
            (job.chunk, job.attempt)
        };
        self.ctx
            .metadata
            .record_job_outcome(self.query_id(), job_id, chunk, attempt, "DONE")
            .await?;
        if self.jobs.values().all(|j| j.state == JobState::Done) {
            self.complete_query().await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn complete_query(&mut self) -> CzarResult<()> {
        self.merger.finalize(&self.spec.merge).await?;
        self.finish(QueryState::Completed).await;
        info!(query_id = %self.query_id(), "user query completed");
        Ok(())
    }

    /// Per-level deadlines: dispatch timeouts requeue the attempt, the job
    /// deadline is fatal, the query deadline cancels everything. Returns
    /// true when the query ended.
    async fn check_timeouts(&mut self) -> CzarResult<bool> {
        let now = std::time::Instant::now();
        let dispatch_timeout = Duration::from_secs(self.ctx.dispatch.dispatch_timeout_seconds);
        let job_timeout = Duration::from_secs(self.ctx.dispatch.job_timeout_seconds);
        let query_elapsed = now.duration_since(
            self.jobs
                .values()
                .map(|j| j.created_at)
                .min()
                .unwrap_or(now),
        );
        if query_elapsed > Duration::from_secs(self.ctx.dispatch.query_timeout_seconds) {
            self.user_query
                .messages
                .error(5, "query deadline exceeded");
            self.cancel_query().await;
            return Ok(true);
        }

        let stalled: Vec<(JobId, u32)> = self
            .jobs
            .values()
            .filter(|job| {
                job.state == JobState::Dispatched
                    && job
                        .dispatched_at
                        .is_some_and(|at| now.duration_since(at) > dispatch_timeout)
            })
            .map(|job| (job.job_id, job.attempt))
            .collect();
        for (job_id, attempt) in stalled {
            let err = CzarError::Timeout(format!("job {job_id} dispatch deadline expired"));
            if self.fail_job(job_id, attempt, &err).await? {
                return Ok(true);
            }
        }

        let overdue: Vec<JobId> = self
            .jobs
            .values()
            .filter(|job| {
                !job.state.is_terminal() && now.duration_since(job.created_at) > job_timeout
            })
            .map(|job| job.job_id)
            .collect();
        if let Some(job_id) = overdue.first() {
            return Err(CzarError::Timeout(format!(
                "job {job_id} exceeded its overall deadline"
            )));
        }
        Ok(false)
    }

    /// Cancel every live job, drop the result and end CANCELLED.
    async fn cancel_query(&mut self) {
        info!(query_id = %self.query_id(), "cancelling user query");
        let cancels: Vec<(JobId, Option<WorkerRef>)> = self
            .jobs
            .values_mut()
            .filter(|job| !job.state.is_terminal())
            .map(|job| {
                let target = matches!(
                    job.state,
                    JobState::Dispatched | JobState::Running | JobState::Streaming
                )
                .then(|| job.worker.clone())
                .flatten();
                job.state = JobState::Cancelled;
                (job.job_id, target)
            })
            .collect();
        for (job_id, worker) in cancels {
            if let Some(worker) = worker {
                let cancel = Message::Cancel(CancelMsg {
                    query_id: self.query_id(),
                    job_id,
                });
                if let Err(err) = self.ctx.transport.send(&worker.addr(), cancel).await {
                    debug!(job = %job_id, error = %err, "cancel delivery failed");
                }
            }
        }
        if let Err(err) = self.merger.abort().await {
            warn!(query_id = %self.query_id(), error = %err, "result drop failed during cancel");
        }
        self.finish(QueryState::Cancelled).await;
    }

    /// Fail the query: cancel outstanding work, drop partial results.
    async fn fail_query(&mut self, err: &CzarError) {
        warn!(query_id = %self.query_id(), error = %err, "user query failed");
        self.user_query.messages.error(err.code(), err.to_string());
        let cancels: Vec<(JobId, Option<WorkerRef>)> = self
            .jobs
            .values_mut()
            .filter(|job| !job.state.is_terminal())
            .map(|job| {
                let target = job.worker.clone();
                job.state = JobState::Cancelled;
                (job.job_id, target)
            })
            .collect();
        for (job_id, worker) in cancels {
            if let Some(worker) = worker {
                let cancel = Message::Cancel(CancelMsg {
                    query_id: self.query_id(),
                    job_id,
                });
                let _ = self.ctx.transport.send(&worker.addr(), cancel).await;
            }
        }
        if let Err(drop_err) = self.merger.abort().await {
            warn!(query_id = %self.query_id(), error = %drop_err, "result drop failed");
        }
        self.finish(QueryState::Failed).await;
    }

    async fn finish(&self, state: QueryState) {
        self.user_query.set_state(state);
        if let Err(err) = self.ctx.metadata.update_state(self.query_id(), state).await {
            warn!(query_id = %self.query_id(), error = %err, "metadata update failed");
        }
    }
}
