//! Shared task fixtures for unit tests

use std::sync::Arc;

use skyshard_common::{ChunkId, CzarId, JobId, QueryId, SubchunkId};
use skyshard_config::MemManConfig;
use skyshard_proto::{ScanRating, ScanTableSpec, TaskFragment, TaskMsg};
use tokio::sync::mpsc;

use crate::memman::MemMan;
use crate::send_channel::{Outbound, ReplyBudget, SendChannel};
use crate::task::Task;

pub fn test_memman_config() -> MemManConfig {
    MemManConfig {
        budget_mb: 100_000,
        fast_table_mb: 1,
        medium_table_mb: 2,
        slow_table_mb: 4,
        snail_table_mb: 8,
    }
}

pub fn test_memman() -> Arc<MemMan> {
    Arc::new(MemMan::new(&test_memman_config()))
}

fn build_task(msg: &TaskMsg, out: mpsc::Sender<Outbound>, budget: Arc<ReplyBudget>) -> Arc<Task> {
    let channel = Arc::new(SendChannel::new(
        msg.query_id,
        msg.job_id,
        msg.attempt,
        out,
        budget,
    ));
    Arc::new(Task::new(msg, channel))
}

fn base_msg(query_id: u64, job_id: u32, chunk: u32, interactive: bool) -> TaskMsg {
    TaskMsg {
        query_id: QueryId(query_id),
        job_id: JobId(job_id),
        attempt: 1,
        czar_id: CzarId(1),
        db: "LSST".to_string(),
        chunk: ChunkId(chunk),
        scan_interactive: interactive,
        scan_tables: vec![ScanTableSpec {
            db: "LSST".to_string(),
            table: "Object".to_string(),
            lock_in_mem: true,
            scan_rating: ScanRating::Medium,
        }],
        fragments: vec![TaskFragment {
            queries: vec!["SELECT 1".to_string()],
            subchunks: vec![],
            result_table: format!("qserv_result_{query_id}"),
        }],
    }
}

/// Task with a detached channel, for scheduler-only tests.
pub fn make_task(query_id: u64, job_id: u32, chunk: u32, interactive: bool) -> Arc<Task> {
    let (tx, _rx) = mpsc::channel(8);
    let budget = Arc::new(ReplyBudget::new(1024 * 1024));
    build_task(&base_msg(query_id, job_id, chunk, interactive), tx, budget)
}

/// Scan task over an explicit table list.
pub fn make_scan_task(
    query_id: u64,
    job_id: u32,
    chunk: u32,
    tables: &[(&str, ScanRating)],
) -> Arc<Task> {
    let mut msg = base_msg(query_id, job_id, chunk, false);
    msg.scan_tables = tables
        .iter()
        .map(|(table, rating)| ScanTableSpec {
            db: "LSST".to_string(),
            table: (*table).to_string(),
            lock_in_mem: true,
            scan_rating: *rating,
        })
        .collect();
    build_task(&msg, mpsc::channel(8).0, Arc::new(ReplyBudget::new(1024 * 1024)))
}

/// Interactive task wired to a live reply channel, for executor tests.
pub fn make_task_with_fragment(
    query_id: u64,
    job_id: u32,
    chunk: u32,
    sql: &str,
    out: mpsc::Sender<Outbound>,
    budget: Arc<ReplyBudget>,
) -> Arc<Task> {
    let mut msg = base_msg(query_id, job_id, chunk, true);
    msg.fragments = vec![TaskFragment {
        queries: vec![sql.to_string()],
        subchunks: vec![],
        result_table: format!("qserv_result_{query_id}"),
    }];
    build_task(&msg, out, budget)
}

/// Task whose fragment expands over subchunk bindings.
#[allow(clippy::too_many_arguments)]
pub fn make_task_with_subchunks(
    query_id: u64,
    job_id: u32,
    chunk: u32,
    sql: &str,
    subchunks: &[u32],
    out: mpsc::Sender<Outbound>,
    budget: Arc<ReplyBudget>,
) -> Arc<Task> {
    let mut msg = base_msg(query_id, job_id, chunk, true);
    msg.fragments = vec![TaskFragment {
        queries: vec![sql.to_string()],
        subchunks: subchunks.iter().copied().map(SubchunkId).collect(),
        result_table: format!("qserv_result_{query_id}"),
    }];
    build_task(&msg, out, budget)
}
