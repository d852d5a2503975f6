//! Shared-scan scheduling for one scan-speed class
//!
//! Many concurrent multi-chunk queries are served by making one pass over
//! each chunk per scan cycle. Tasks for the chunk currently being scanned
//! sit in the *active* heap; tasks for later chunks wait in *pending*. When
//! the active chunk drains, every pending task of the next-smallest chunk is
//! promoted at once. A task only starts once its tables are locked into the
//! memory manager, and within a chunk the slowest scans start first so their
//! locks establish the shared context.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};

use skyshard_common::ChunkId;
use tracing::{debug, trace};

use crate::memman::{LockOutcome, MemMan};
use crate::sched::TaskQueue;
use crate::task::Task;

/// Heap entry ordered so the schedulable-first task surfaces at the top:
/// smallest chunk id first, slowest scan first within a chunk, table-list
/// lexicographic within a rating.
struct HeapEntry(Arc<Task>);

impl HeapEntry {
    fn schedule_order(&self, other: &Self) -> Ordering {
        self.0
            .chunk()
            .cmp(&other.0.chunk())
            .then_with(|| self.0.scan_info().schedule_cmp(other.0.scan_info()))
            .then_with(|| self.0.key().cmp(&other.0.key()))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.schedule_order(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the maximum; reverse so the schedulable-first
        // entry is the maximum.
        self.schedule_order(other).reverse()
    }
}

#[derive(Default)]
struct Heaps {
    active: BinaryHeap<HeapEntry>,
    pending: BinaryHeap<HeapEntry>,
    active_chunk: Option<ChunkId>,
}

impl Heaps {
    /// Move every task of the next pending chunk into the active heap.
    fn promote_next_chunk(&mut self) {
        let Some(next_chunk) = self.pending.peek().map(|e| e.0.chunk()) else {
            self.active_chunk = None;
            return;
        };
        while let Some(top) = self.pending.peek() {
            if top.0.chunk() != next_chunk {
                break;
            }
            if let Some(entry) = self.pending.pop() {
                self.active.push(entry);
            }
        }
        self.active_chunk = Some(next_chunk);
        debug!(chunk = next_chunk.0, "promoted pending tasks to active chunk");
    }
}

/// One scan class's chunk-ordered task collection.
pub struct ChunkScanQueue {
    memman: Arc<MemMan>,
    heaps: Mutex<Heaps>,
}

impl ChunkScanQueue {
    pub fn new(memman: Arc<MemMan>) -> Self {
        Self {
            memman,
            heaps: Mutex::new(Heaps::default()),
        }
    }

    /// The chunk currently being scanned, if any. Test and status hook.
    pub fn active_chunk(&self) -> Option<ChunkId> {
        self.heaps.lock().ok().and_then(|h| h.active_chunk)
    }
}

impl TaskQueue for ChunkScanQueue {
    fn enqueue(&self, task: Arc<Task>) {
        let Ok(mut heaps) = self.heaps.lock() else {
            return;
        };
        let entry = HeapEntry(task);
        match heaps.active_chunk {
            // Join the in-progress chunk, or start the very first one.
            Some(active) if entry.0.chunk() == active => heaps.active.push(entry),
            None if heaps.active.is_empty() && heaps.pending.is_empty() => {
                heaps.active_chunk = Some(entry.0.chunk());
                heaps.active.push(entry);
            }
            _ => heaps.pending.push(entry),
        }
    }

    fn ready(&self) -> Option<Arc<Task>> {
        let Ok(mut heaps) = self.heaps.lock() else {
            return None;
        };
        loop {
            if heaps.active.is_empty() {
                if heaps.pending.is_empty() {
                    heaps.active_chunk = None;
                    return None;
                }
                heaps.promote_next_chunk();
            }

            let top_cancelled = heaps.active.peek().is_some_and(|e| e.0.is_cancelled());
            if top_cancelled {
                heaps.active.pop();
                continue;
            }

            let top = Arc::clone(&heaps.active.peek()?.0);
            match self.memman.lock(top.scan_info()) {
                LockOutcome::Granted(handle) => {
                    heaps.active.pop();
                    top.store_mem_handle(handle);
                    return Some(top);
                }
                LockOutcome::Insufficient => {
                    // Memory pressure: leave the heap untouched, a later
                    // completion will retry.
                    trace!("memman reports insufficient memory, backing off");
                    return None;
                }
                LockOutcome::Busy => {
                    trace!("memman busy, backing off");
                    return None;
                }
            }
        }
    }

    fn task_complete(&self, task: &Task) {
        if let Some(handle) = task.take_mem_handle() {
            self.memman.unlock(handle);
        }
        if let Ok(mut heaps) = self.heaps.lock() {
            if heaps.active.is_empty() && !heaps.pending.is_empty() {
                heaps.promote_next_chunk();
            }
        }
    }

    fn len(&self) -> usize {
        self.heaps
            .lock()
            .map(|h| h.active.len() + h.pending.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{make_scan_task, make_task, test_memman};
    use skyshard_proto::ScanRating;

    fn drain_order(queue: &ChunkScanQueue) -> Vec<u32> {
        let mut order = Vec::new();
        while let Some(task) = queue.ready() {
            order.push(task.chunk().0);
            queue.task_complete(&task);
        }
        order
    }

    #[test]
    fn chunks_run_in_non_decreasing_order() {
        let queue = ChunkScanQueue::new(test_memman());
        for chunk in [300, 100, 200, 100, 300] {
            queue.enqueue(make_task(chunk as u64, 0, chunk, false));
        }
        let order = drain_order(&queue);
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(order, sorted);
        assert_eq!(order.len(), 5);
    }

    #[test]
    fn slower_scans_lead_within_a_chunk() {
        let queue = ChunkScanQueue::new(test_memman());
        let fast = make_scan_task(1, 0, 100, &[("Object", ScanRating::Fast)]);
        let snail = make_scan_task(2, 0, 100, &[("ForcedSource", ScanRating::Snail)]);
        queue.enqueue(Arc::clone(&fast));
        queue.enqueue(Arc::clone(&snail));

        let first = queue.ready().expect("first task");
        assert_eq!(first.key(), snail.key(), "snail scan takes its locks first");
        queue.task_complete(&first);
        let second = queue.ready().expect("second task");
        assert_eq!(second.key(), fast.key());
        queue.task_complete(&second);
    }

    #[test]
    fn late_arrival_for_active_chunk_joins_it() {
        let queue = ChunkScanQueue::new(test_memman());
        queue.enqueue(make_task(1, 0, 100, false));
        queue.enqueue(make_task(2, 0, 200, false));

        let first = queue.ready().expect("chunk 100 task");
        assert_eq!(first.chunk().0, 100);

        // While 100 is active, a newcomer for 100 goes straight to active.
        queue.enqueue(make_task(3, 0, 100, false));
        let second = queue.ready().expect("second chunk-100 task");
        assert_eq!(second.chunk().0, 100);

        queue.task_complete(&first);
        queue.task_complete(&second);
        let third = queue.ready().expect("chunk 200 task");
        assert_eq!(third.chunk().0, 200);
        queue.task_complete(&third);
    }

    #[test]
    fn memory_pressure_defers_admission() {
        // Budget fits one snail table only; two tasks on different tables.
        let memman = Arc::new(crate::memman::MemMan::new(&skyshard_config::MemManConfig {
            budget_mb: 400,
            fast_table_mb: 10,
            medium_table_mb: 100,
            slow_table_mb: 200,
            snail_table_mb: 400,
        }));
        let queue = ChunkScanQueue::new(Arc::clone(&memman));
        queue.enqueue(make_scan_task(1, 0, 100, &[("A", ScanRating::Snail)]));
        queue.enqueue(make_scan_task(2, 0, 100, &[("B", ScanRating::Snail)]));

        let first = queue.ready().expect("first snail admitted");
        assert!(queue.ready().is_none(), "no budget for the second table");

        queue.task_complete(&first);
        let second = queue.ready().expect("admitted after release");
        queue.task_complete(&second);
    }

    #[test]
    fn cancelled_tasks_never_run() {
        let queue = ChunkScanQueue::new(test_memman());
        let doomed = make_task(1, 0, 100, false);
        queue.enqueue(Arc::clone(&doomed));
        doomed.cancel();
        assert!(queue.ready().is_none());
    }
}
