//! Unified priority queue of chunk tasks. Every executor drains one of
//! these; priorities order the heap and a monotonic id breaks ties in FIFO
//! order so equal-priority tasks never starve each other.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

/// Priority levels of chunk tasks, lowest first so the derived ordering
/// ranks `Critical` above everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    Background,
    Low,
    Normal,
    High,
    Critical,
}

/// A queued unit of work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

struct QueuedTask {
    priority: TaskPriority,
    id: u64,
    job: Job,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.id == other.id
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Higher priority first; within a priority, the smaller id is the
        // older task and must come out first.
        self.priority.cmp(&other.priority)
            .then_with(|| other.id.cmp(&self.id))
    }
}

struct Inner {
    heap: BinaryHeap<QueuedTask>,
    closed: bool,
}

/// A blocking priority queue shared by the workers of one executor.
pub struct TaskQueue {
    inner: Mutex<Inner>,
    cond: Condvar,
    next_id: AtomicU64,
}

impl TaskQueue {

    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { heap: BinaryHeap::new(), closed: false }),
            cond: Condvar::new(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Submit a task. A closed queue refuses the push and hands the job
    /// back so the caller can run it inline or drop it knowingly.
    pub fn push(&self, priority: TaskPriority, job: Job) -> Result<(), Job> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(job);
        }
        inner.heap.push(QueuedTask { priority, id, job });
        drop(inner);
        self.cond.notify_one();
        Ok(())
    }

    /// Block until a task is available, or return none once the queue is
    /// closed and fully drained.
    pub fn pop(&self) -> Option<Job> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(task) = inner.heap.pop() {
                return Some(task.job);
            }
            if inner.closed {
                return None;
            }
            self.cond.wait(&mut inner);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the queue. Already queued tasks still drain; new pushes are
    /// refused.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.cond.notify_all();
    }

}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
