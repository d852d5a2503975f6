//! Executor pool
//!
//! A fixed number of loops drain the scheduler, run admitted tasks against
//! the local database, and stream the produced rows back through the task's
//! send channel. A separate monitor loop demotes tasks that overstay their
//! scan class and fails queries that exhaust their boot budget.
//!
//! A task suspends in exactly three places: waiting for its memory lock
//! (inside the scheduler), waiting for reply-buffer budget (inside the send
//! channel), and waiting for the next scheduling cycle. It never suspends
//! while holding a memory lock except to wait for reply budget, which is
//! released by the transport writer independent of the pool.

use bytes::Bytes;
use skyshard_proto::{ChecksumAccumulator, ReplyHeader, TaskState, WireErrorCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{WorkerError, WorkerResult};
use crate::service::ServiceContext;
use crate::task::Task;

const BATCH_ROWS: usize = 4096;
const BOOT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Spawn the executor pool and the boot monitor. Handles run until process
/// shutdown.
pub fn spawn_pool(ctx: &Arc<ServiceContext>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(ctx.config.scheduler.pool_size + 1);
    for worker in 0..ctx.config.scheduler.pool_size {
        let ctx = Arc::clone(ctx);
        handles.push(tokio::spawn(async move {
            debug!(worker, "executor loop started");
            executor_loop(&ctx).await;
        }));
    }
    let monitor_ctx = Arc::clone(ctx);
    handles.push(tokio::spawn(async move {
        boot_monitor(&monitor_ctx).await;
    }));
    info!(pool = ctx.config.scheduler.pool_size, "executor pool running");
    handles
}

async fn executor_loop(ctx: &Arc<ServiceContext>) {
    loop {
        match ctx.scheduler.next_task() {
            Some(task) => execute_task(ctx, task).await,
            None => {
                if ctx.scheduler.is_shutting_down()
                    && ctx.scheduler.queued_len() == 0
                    && ctx.scheduler.running_len() == 0
                {
                    debug!("executor loop drained, exiting");
                    return;
                }
                ctx.scheduler.work_available().await;
            }
        }
    }
}

/// Run one admitted task to completion and stream its result.
pub async fn execute_task(ctx: &Arc<ServiceContext>, task: Arc<Task>) {
    if task.is_cancelled() {
        ctx.finish_task(&task);
        return;
    }
    task.set_state(TaskState::InProgress);
    let _ = task.channel().send_status(TaskState::InProgress).await;

    let outcome = run_and_stream(ctx, &task).await;
    match outcome {
        Ok(rows) => {
            task.set_state(TaskState::Complete);
            debug!(task = %task.key(), rows, "task complete");
        }
        Err(WorkerError::Cancelled) => {
            task.set_state(TaskState::Cancelled);
            debug!(task = %task.key(), "task cancelled mid-flight");
        }
        Err(err) => {
            task.set_state(TaskState::Complete);
            warn!(task = %task.key(), error = %err, "task failed");
            let code = match &err {
                WorkerError::ChannelDead | WorkerError::Io(_) => WireErrorCode::Transport,
                _ => WireErrorCode::Internal,
            };
            let _ = task.channel().send_error(code, err.to_string()).await;
        }
    }
    ctx.finish_task(&task);
}

/// Execute every fragment, then publish header and blobs.
///
/// The whole result is materialized before the header goes out because the
/// header carries the stream digest and row count. The reply budget applies
/// to frames queued for the socket, not to this staging buffer.
async fn run_and_stream(ctx: &Arc<ServiceContext>, task: &Arc<Task>) -> WorkerResult<u64> {
    let mut blobs: Vec<Bytes> = Vec::new();
    let mut checksum = ChecksumAccumulator::new();
    let mut total_rows: u64 = 0;

    for fragment in task.fragments() {
        let statements = render_fragment(fragment);
        for sql in statements {
            let mut batches = ctx.runner.run(task.db(), &sql, BATCH_ROWS).await?;
            loop {
                let batch = tokio::select! {
                    biased;
                    () = task.cancelled_wait() => return Err(WorkerError::Cancelled),
                    batch = batches.recv() => batch,
                };
                let Some(batch) = batch else { break };
                let bundle = batch?;
                if bundle.is_empty() && bundle.columns.is_empty() {
                    continue;
                }
                total_rows += bundle.row_count();
                let payload = bundle.encode();
                checksum.update(&payload);
                blobs.push(payload);
            }
        }
    }

    // The tables have been read; release their memory locks before the
    // first potentially blocking send so no task ever suspends on reply
    // budget while pinning tables.
    if let Some(handle) = task.take_mem_handle() {
        ctx.memman.unlock(handle);
    }

    let byte_count = checksum.byte_count();
    let digest = checksum.finish();
    let channel = task.channel();
    task.set_state(TaskState::Streaming);

    channel
        .send_header(ReplyHeader {
            query_id: task.key().query_id,
            job_id: task.key().job_id,
            attempt: task.attempt(),
            row_count: total_rows,
            byte_count,
            md5: digest,
            end_no_data: blobs.is_empty(),
        })
        .await?;

    let last_index = blobs.len().saturating_sub(1);
    for (index, payload) in blobs.into_iter().enumerate() {
        let last = index == last_index;
        tokio::select! {
            biased;
            () = task.cancelled_wait() => return Err(WorkerError::Cancelled),
            sent = channel.send(payload, last) => sent?,
        }
    }
    Ok(total_rows)
}

/// Expand a fragment into concrete statements: one per subchunk binding, or
/// the statements as-is for chunk-only queries.
fn render_fragment(fragment: &skyshard_proto::TaskFragment) -> Vec<String> {
    if fragment.subchunks.is_empty() {
        return fragment.queries.clone();
    }
    let mut statements = Vec::with_capacity(fragment.queries.len() * fragment.subchunks.len());
    for subchunk in &fragment.subchunks {
        for query in &fragment.queries {
            statements.push(query.replace(skyshard_proto::SUBCHUNK_TOKEN, &subchunk.to_string()));
        }
    }
    statements
}

/// Periodically demote overstaying tasks; fail queries over their boot
/// budget.
async fn boot_monitor(ctx: &Arc<ServiceContext>) {
    let mut ticker = tokio::time::interval(BOOT_SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        let exhausted = ctx.scheduler.boot_overdue();
        for query_id in exhausted {
            error!(%query_id, "boot budget exhausted, failing user query");
            ctx.cancel_query(query_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::MockQueryRunner;
    use crate::send_channel::Outbound;
    use crate::test_support::make_task_with_fragment;
    use skyshard_config::WorkerConfig;
    use skyshard_proto::{Message, RowBundle};
    use tokio::sync::mpsc;

    fn context_with(runner: Arc<MockQueryRunner>) -> Arc<ServiceContext> {
        let ctx = ServiceContext::new(WorkerConfig::default(), runner);
        ctx.add_chunk("LSST", skyshard_common::ChunkId(100));
        ctx
    }

    async fn collect_frames(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Message> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame.message);
        }
        frames
    }

    #[tokio::test]
    async fn result_stream_carries_header_then_final_blob() {
        let runner = Arc::new(MockQueryRunner::new());
        let sql = "SELECT COUNT(*) FROM LSST.Object_100";
        let mut bundle = RowBundle::new(vec!["QS1_COUNT".to_string()]);
        bundle.rows.push(vec![Some("42".to_string())]);
        runner.stage(sql, bundle);

        let ctx = context_with(Arc::clone(&runner));
        let (tx, mut rx) = mpsc::channel(16);
        let task = make_task_with_fragment(7, 0, 100, sql, tx, Arc::clone(&ctx.budget));

        ctx.scheduler.enqueue(Arc::clone(&task));
        let admitted = ctx.scheduler.next_task().expect("admitted");
        execute_task(&ctx, admitted).await;

        let frames = collect_frames(&mut rx).await;
        let header = frames.iter().find_map(|m| match m {
            Message::ReplyHeader(h) => Some(h.clone()),
            _ => None,
        });
        let header = header.expect("header frame present");
        assert_eq!(header.row_count, 1);
        assert!(!header.end_no_data);

        let blob = frames.iter().find_map(|m| match m {
            Message::ReplyBlob(b) => Some(b.clone()),
            _ => None,
        });
        let blob = blob.expect("blob frame present");
        assert!(blob.last, "single blob is flagged last");

        let mut check = ChecksumAccumulator::new();
        check.update(&blob.payload);
        assert_eq!(check.finish(), header.md5, "digest covers the stream");
    }

    #[tokio::test]
    async fn empty_result_short_circuits_with_end_no_data() {
        let runner = Arc::new(MockQueryRunner::new());
        let ctx = context_with(Arc::clone(&runner));
        let (tx, mut rx) = mpsc::channel(16);
        let task = make_task_with_fragment(8, 0, 100, "SELECT 1", tx, Arc::clone(&ctx.budget));

        ctx.scheduler.enqueue(Arc::clone(&task));
        let admitted = ctx.scheduler.next_task().expect("admitted");
        execute_task(&ctx, admitted).await;

        let frames = collect_frames(&mut rx).await;
        let header = frames
            .iter()
            .find_map(|m| match m {
                Message::ReplyHeader(h) => Some(h.clone()),
                _ => None,
            })
            .expect("header present");
        assert!(header.end_no_data);
        assert_eq!(header.row_count, 0);
        assert!(
            !frames.iter().any(|m| matches!(m, Message::ReplyBlob(_))),
            "no blobs follow an end_no_data header"
        );
    }

    #[tokio::test]
    async fn failed_query_reports_an_error_frame() {
        let runner = Arc::new(MockQueryRunner::new());
        let sql = "SELECT broken FROM LSST.Object_100";
        runner.stage_failure(sql, "unknown column 'broken'");

        let ctx = context_with(Arc::clone(&runner));
        let (tx, mut rx) = mpsc::channel(16);
        let task = make_task_with_fragment(9, 0, 100, sql, tx, Arc::clone(&ctx.budget));

        ctx.scheduler.enqueue(Arc::clone(&task));
        let admitted = ctx.scheduler.next_task().expect("admitted");
        execute_task(&ctx, admitted).await;

        let frames = collect_frames(&mut rx).await;
        assert!(
            frames.iter().any(|m| matches!(m, Message::Error(e) if e.code == WireErrorCode::Internal)),
            "execution failure surfaces as an error frame"
        );
    }

    #[tokio::test]
    async fn subchunk_fragments_expand_per_subchunk() {
        let runner = Arc::new(MockQueryRunner::new());
        let ctx = context_with(Arc::clone(&runner));
        let (tx, _rx) = mpsc::channel(16);
        let task = crate::test_support::make_task_with_subchunks(
            10,
            0,
            100,
            "SELECT * FROM Subchunks_LSST_100.Object_100_%SS%",
            &[0, 1, 2],
            tx,
            Arc::clone(&ctx.budget),
        );

        ctx.scheduler.enqueue(Arc::clone(&task));
        let admitted = ctx.scheduler.next_task().expect("admitted");
        execute_task(&ctx, admitted).await;

        let executed = runner.executed();
        assert_eq!(executed.len(), 3);
        assert!(executed[0].ends_with("Object_100_0"));
        assert!(executed[2].ends_with("Object_100_2"));
    }
}
