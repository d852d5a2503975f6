//! Grouping queue for interactive tasks
//!
//! Interactive queries skip the shared-scan machinery but still benefit from
//! chunk locality: tasks touching the same chunk are queued adjacently so
//! consecutive admissions hit a warm buffer cache. No memory locks are
//! taken; interactive chunks are assumed resident.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use skyshard_common::ChunkId;

use crate::sched::TaskQueue;
use crate::task::Task;

struct Group {
    chunk: ChunkId,
    tasks: VecDeque<Arc<Task>>,
}

/// FIFO of chunk groups; arrival order between chunks, locality within.
#[derive(Default)]
pub struct GroupQueue {
    groups: Mutex<VecDeque<Group>>,
}

impl GroupQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskQueue for GroupQueue {
    fn enqueue(&self, task: Arc<Task>) {
        let Ok(mut groups) = self.groups.lock() else {
            return;
        };
        if let Some(group) = groups.iter_mut().find(|g| g.chunk == task.chunk()) {
            group.tasks.push_back(task);
        } else {
            let mut tasks = VecDeque::new();
            let chunk = task.chunk();
            tasks.push_back(task);
            groups.push_back(Group { chunk, tasks });
        }
    }

    fn ready(&self) -> Option<Arc<Task>> {
        let Ok(mut groups) = self.groups.lock() else {
            return None;
        };
        loop {
            let front = groups.front_mut()?;
            let task = front.tasks.pop_front();
            if front.tasks.is_empty() {
                groups.pop_front();
            }
            match task {
                Some(task) if task.is_cancelled() => continue,
                Some(task) => return Some(task),
                None => continue,
            }
        }
    }

    fn task_complete(&self, _task: &Task) {}

    fn len(&self) -> usize {
        self.groups
            .lock()
            .map(|groups| groups.iter().map(|g| g.tasks.len()).sum())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::make_task;

    #[test]
    fn same_chunk_tasks_stay_adjacent() {
        let queue = GroupQueue::new();
        let a1 = make_task(1, 0, 100, true);
        let b = make_task(2, 0, 200, true);
        let a2 = make_task(3, 0, 100, true);
        queue.enqueue(Arc::clone(&a1));
        queue.enqueue(Arc::clone(&b));
        queue.enqueue(Arc::clone(&a2));

        let order: Vec<u32> = std::iter::from_fn(|| queue.ready())
            .map(|t| t.chunk().0)
            .collect();
        assert_eq!(order, vec![100, 100, 200], "chunk 100 group served together");
    }

    #[test]
    fn cancelled_tasks_are_skipped() {
        let queue = GroupQueue::new();
        let doomed = make_task(1, 0, 100, true);
        let live = make_task(2, 0, 100, true);
        queue.enqueue(Arc::clone(&doomed));
        queue.enqueue(Arc::clone(&live));
        doomed.cancel();

        let next = queue.ready().expect("live task");
        assert_eq!(next.key(), live.key());
        assert!(queue.ready().is_none());
    }
}
