//! Task admission scheduling
//!
//! A fixed pool of executor loops draws work from a set of priority classes.
//! Each class owns a queue (grouping for interactive tasks, chunk-ordered
//! shared scans for the rest) and a `{min_running, max_running}` pair. The
//! selection walk guarantees forward progress for high-priority classes
//! without letting any class monopolize the pool:
//!
//! 1. unless shutting down, walk classes by priority and admit from any
//!    class below its `min_running`;
//! 2. walk again and admit from any class below `max_running`;
//! 3. otherwise sleep until an enqueue or completion.

pub mod chunk_scan;
pub mod group;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use skyshard_common::QueryId;
use skyshard_config::SchedulerConfig;
use skyshard_proto::ScanRating;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::memman::MemMan;
use crate::sched::chunk_scan::ChunkScanQueue;
use crate::sched::group::GroupQueue;
use crate::task::{Task, TaskKey};

/// A collection of queued tasks with class-specific ordering and resource
/// admission rules.
pub trait TaskQueue: Send + Sync {
    fn enqueue(&self, task: Arc<Task>);
    /// Pop the next admissible task, acquiring any locks it needs. `None`
    /// means nothing can start right now (empty, or resources exhausted).
    fn ready(&self) -> Option<Arc<Task>>;
    /// Release queue-held resources after the task ran or was cancelled.
    fn task_complete(&self, task: &Task);
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct SchedulerClass {
    name: &'static str,
    priority: i32,
    min_running: usize,
    max_running: usize,
    max_active: Option<Duration>,
    running: AtomicUsize,
    queue: Box<dyn TaskQueue>,
}

struct RunningEntry {
    task: Arc<Task>,
    class_idx: usize,
    since: Instant,
}

/// The worker's scheduler: class queues, the admission walk, and running
/// accounting shared by every executor loop.
pub struct WorkerScheduler {
    classes: Vec<SchedulerClass>,
    snail_idx: usize,
    running: DashMap<TaskKey, RunningEntry>,
    boots_per_query: DashMap<QueryId, u32>,
    max_boots_per_user_query: u32,
    notify: Notify,
    shutting_down: AtomicBool,
}

impl WorkerScheduler {
    pub fn new(config: &SchedulerConfig, memman: Arc<MemMan>) -> Self {
        let mut classes = vec![SchedulerClass {
            name: "interactive",
            priority: 0,
            min_running: config.interactive_min_running,
            max_running: config.interactive_max_running,
            max_active: None,
            running: AtomicUsize::new(0),
            queue: Box::new(GroupQueue::new()),
        }];
        for (name, class) in [
            ("fast", &config.fast),
            ("medium", &config.medium),
            ("slow", &config.slow),
            ("snail", &config.snail),
        ] {
            classes.push(SchedulerClass {
                name,
                priority: class.priority,
                min_running: class.min_running,
                max_running: class.max_running,
                max_active: Some(Duration::from_secs(class.max_active_minutes * 60)),
                running: AtomicUsize::new(0),
                queue: Box::new(ChunkScanQueue::new(Arc::clone(&memman))),
            });
        }
        classes.sort_by_key(|c| c.priority);
        let snail_idx = classes.len() - 1;
        Self {
            classes,
            snail_idx,
            running: DashMap::new(),
            boots_per_query: DashMap::new(),
            max_boots_per_user_query: config.max_boots_per_user_query,
            notify: Notify::new(),
            shutting_down: AtomicBool::new(false),
        }
    }

    fn class_for(&self, task: &Task) -> usize {
        if task.is_interactive() {
            return 0;
        }
        let wanted = match task.scan_info().speed() {
            ScanRating::Fast => "fast",
            ScanRating::Medium => "medium",
            ScanRating::Slow => "slow",
            ScanRating::Snail => "snail",
        };
        self.classes
            .iter()
            .position(|c| c.name == wanted)
            .unwrap_or(self.snail_idx)
    }

    /// Queue a task on its class. Wakes one waiting executor.
    pub fn enqueue(&self, task: Arc<Task>) {
        let idx = self.class_for(&task);
        debug!(task = %task.key(), class = self.classes[idx].name, "task queued");
        self.classes[idx].queue.enqueue(task);
        self.notify.notify_one();
    }

    /// The admission walk. Returns a task already accounted as running.
    pub fn next_task(&self) -> Option<Arc<Task>> {
        // Pass 1: keep every class at its minimum, highest priority first.
        // Skipped during shutdown so draining classes can finish unimpeded.
        if !self.shutting_down.load(Ordering::SeqCst) {
            for (idx, class) in self.classes.iter().enumerate() {
                if class.running.load(Ordering::SeqCst) < class.min_running {
                    if let Some(task) = class.queue.ready() {
                        self.admit(idx, &task);
                        return Some(task);
                    }
                }
            }
        }

        // Pass 2: minimums are satisfied; admit anywhere below maximum.
        for (idx, class) in self.classes.iter().enumerate() {
            if class.running.load(Ordering::SeqCst) < class.max_running {
                if let Some(task) = class.queue.ready() {
                    self.admit(idx, &task);
                    return Some(task);
                }
            }
        }
        None
    }

    fn admit(&self, class_idx: usize, task: &Arc<Task>) {
        self.classes[class_idx].running.fetch_add(1, Ordering::SeqCst);
        self.running.insert(
            task.key(),
            RunningEntry {
                task: Arc::clone(task),
                class_idx,
                since: Instant::now(),
            },
        );
        // Another executor may now find work in a lower class.
        self.notify.notify_one();
    }

    /// Account a task's completion and release queue resources.
    pub fn task_complete(&self, task: &Task) {
        let class_idx = self
            .running
            .remove(&task.key())
            .map_or_else(|| self.class_for(task), |(_, entry)| entry.class_idx);
        let class = &self.classes[class_idx];
        class.running.fetch_sub(1, Ordering::SeqCst);
        class.queue.task_complete(task);
        self.notify.notify_waiters();
    }

    /// Sleep until an enqueue or completion might have made work available.
    pub async fn work_available(&self) {
        self.notify.notified().await;
    }

    /// Total queued (not running) tasks, for status reporting.
    pub fn queued_len(&self) -> usize {
        self.classes.iter().map(|c| c.queue.len()).sum()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    /// Demote running tasks that have held their slot past the class cap.
    /// Each boot moves the task's accounting to the snail class, freeing a
    /// slot in its original class. Returns the queries whose boot budget is
    /// now exhausted; the caller fails them.
    pub fn boot_overdue(&self) -> Vec<QueryId> {
        let now = Instant::now();
        let mut exhausted = Vec::new();
        for mut entry in self.running.iter_mut() {
            let class = &self.classes[entry.class_idx];
            let Some(max_active) = class.max_active else {
                continue;
            };
            if entry.class_idx == self.snail_idx || now.duration_since(entry.since) < max_active {
                continue;
            }
            let task = Arc::clone(&entry.task);
            let boots = task.record_boot();
            class.running.fetch_sub(1, Ordering::SeqCst);
            self.classes[self.snail_idx]
                .running
                .fetch_add(1, Ordering::SeqCst);
            entry.class_idx = self.snail_idx;
            entry.since = now;
            warn!(task = %task.key(), from = class.name, boots, "task booted to snail class");

            let query_id = task.key().query_id;
            let mut total = self.boots_per_query.entry(query_id).or_insert(0);
            *total += 1;
            if *total > self.max_boots_per_user_query {
                exhausted.push(query_id);
            }
        }
        self.notify.notify_waiters();
        exhausted
    }

    /// Begin draining: no pass-1 minimum guarantees, so outstanding work
    /// finishes under the per-class maxima and nothing new is favored.
    pub fn prepare_shutdown(&self) {
        info!("scheduler draining: shutdown prepared");
        self.shutting_down.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{make_scan_task, make_task, test_memman_config};
    use skyshard_proto::ScanRating;

    fn tiny_scheduler() -> WorkerScheduler {
        let config = SchedulerConfig {
            pool_size: 4,
            interactive_min_running: 1,
            interactive_max_running: 2,
            ..SchedulerConfig::default()
        };
        let memman = Arc::new(MemMan::new(&test_memman_config()));
        WorkerScheduler::new(&config, memman)
    }

    #[test]
    fn interactive_tasks_admit_before_scans() {
        let sched = tiny_scheduler();
        sched.enqueue(make_task(1, 0, 100, false));
        sched.enqueue(make_task(2, 0, 100, true));

        let first = sched.next_task().expect("admits");
        assert!(first.is_interactive(), "interactive class has top priority");
        sched.task_complete(&first);

        let second = sched.next_task().expect("admits scan");
        assert!(!second.is_interactive());
        sched.task_complete(&second);
    }

    #[test]
    fn class_maximum_caps_admission() {
        let config = SchedulerConfig {
            interactive_min_running: 1,
            interactive_max_running: 1,
            ..SchedulerConfig::default()
        };
        let sched = WorkerScheduler::new(&config, Arc::new(MemMan::new(&test_memman_config())));
        sched.enqueue(make_task(1, 0, 100, true));
        sched.enqueue(make_task(2, 0, 100, true));

        let first = sched.next_task().expect("first interactive");
        assert!(sched.next_task().is_none(), "max_running=1 blocks the second");
        sched.task_complete(&first);
        let second = sched.next_task().expect("admitted after completion");
        sched.task_complete(&second);
    }

    #[test]
    fn completion_accounting_survives_mixed_classes() {
        let sched = tiny_scheduler();
        sched.enqueue(make_scan_task(1, 0, 100, &[("Object", ScanRating::Fast)]));
        sched.enqueue(make_scan_task(2, 0, 100, &[("Source", ScanRating::Snail)]));

        let mut admitted = Vec::new();
        while let Some(task) = sched.next_task() {
            admitted.push(task);
        }
        assert_eq!(admitted.len(), 2);
        assert_eq!(sched.running_len(), 2);
        for task in &admitted {
            sched.task_complete(task);
        }
        assert_eq!(sched.running_len(), 0);
        assert_eq!(sched.queued_len(), 0);
    }

    #[test]
    fn shutdown_skips_minimum_pass_but_still_drains() {
        let sched = tiny_scheduler();
        sched.enqueue(make_task(1, 0, 100, true));
        sched.prepare_shutdown();
        assert!(sched.is_shutting_down());
        let task = sched.next_task().expect("pass 2 still admits queued work");
        sched.task_complete(&task);
    }
}
