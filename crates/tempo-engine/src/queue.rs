use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempo_core::{ExecutionId, JobDefinition};
use tokio::sync::{watch, Notify, Semaphore};
use tracing::{debug, info};

/// Work item waiting in a [`TimezoneQueue`].
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub execution_id: ExecutionId,
    pub job: JobDefinition,
    /// The job must not start before this instant.
    pub deadline: DateTime<Utc>,
}

/// Executes work popped from a queue. Implemented by the engine.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run_queued(&self, item: QueuedJob);
}

/// Snapshot returned by [`TimezoneQueue::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Waiting, not yet started.
    pub depth: usize,
    /// Currently running.
    pub active: usize,
    pub max_concurrent: usize,
    /// Finished since the queue was created.
    pub completed: u64,
}

struct Entry {
    deadline: DateTime<Utc>,
    priority: i32,
    seq: u64,
    item: QueuedJob,
}

impl Entry {
    /// Earlier deadline first, then higher priority, then insertion order.
    fn key_cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the max-heap pops the entry that should run first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key_cmp(self)
    }
}

#[derive(Default)]
struct Pending {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

/// Deadline-ordered queue for one IANA timezone with a bounded worker pool.
///
/// [`run`](Self::run) sleeps until the earliest deadline (or an insertion),
/// then hands ready work to the runner on a spawned task while holding one of
/// `max_concurrent` permits.
pub struct TimezoneQueue {
    timezone: String,
    max_concurrent: usize,
    pending: Mutex<Pending>,
    wake: Notify,
    permits: Arc<Semaphore>,
    active: AtomicUsize,
    completed: AtomicU64,
}

impl TimezoneQueue {
    pub fn new(timezone: impl Into<String>, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            timezone: timezone.into(),
            max_concurrent,
            pending: Mutex::new(Pending::default()),
            wake: Notify::new(),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
        }
    }

    pub fn timezone(&self) -> &str {
        &self.timezone
    }

    pub fn push(&self, item: QueuedJob) {
        {
            let mut pending = self.pending.lock().unwrap();
            let seq = pending.next_seq;
            pending.next_seq += 1;
            debug!(timezone = %self.timezone, execution_id = %item.execution_id, deadline = %item.deadline, "job queued");
            pending.heap.push(Entry {
                deadline: item.deadline,
                priority: item.job.priority,
                seq,
                item,
            });
        }
        self.wake.notify_one();
    }

    /// Drop a job that has not started yet.
    pub fn remove(&self, execution_id: &ExecutionId) -> Option<QueuedJob> {
        let mut pending = self.pending.lock().unwrap();
        let heap = std::mem::take(&mut pending.heap);
        let (hit, keep): (Vec<Entry>, Vec<Entry>) = heap
            .into_vec()
            .into_iter()
            .partition(|e| e.item.execution_id == *execution_id);
        pending.heap = keep.into();
        hit.into_iter().next().map(|e| e.item)
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            depth: self.pending.lock().unwrap().heap.len(),
            active: self.active.load(AtomicOrdering::SeqCst),
            max_concurrent: self.max_concurrent,
            completed: self.completed.load(AtomicOrdering::SeqCst),
        }
    }

    /// Dispatch loop. Runs until `shutdown` broadcasts `true` or the runner is dropped.
    pub async fn run(self: Arc<Self>, runner: Weak<dyn JobRunner>, mut shutdown: watch::Receiver<bool>) {
        info!(timezone = %self.timezone, max_concurrent = self.max_concurrent, "timezone queue started");
        loop {
            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
                stop = shutdown_requested(&mut shutdown) => if stop { break } else { continue },
            };

            let item = tokio::select! {
                item = self.next_ready() => item,
                stop = shutdown_requested(&mut shutdown) => if stop { break } else { continue },
            };

            let Some(runner) = runner.upgrade() else {
                break;
            };
            self.active.fetch_add(1, AtomicOrdering::SeqCst);
            let queue = Arc::clone(&self);
            tokio::spawn(async move {
                runner.run_queued(item).await;
                queue.active.fetch_sub(1, AtomicOrdering::SeqCst);
                queue.completed.fetch_add(1, AtomicOrdering::SeqCst);
                drop(permit);
            });
        }
        info!(timezone = %self.timezone, "timezone queue stopped");
    }

    // ---- private helpers ----

    /// Wait until the head of the heap is due and pop it. Never returns early.
    async fn next_ready(&self) -> QueuedJob {
        loop {
            let wait = {
                let mut pending = self.pending.lock().unwrap();
                match pending.heap.peek().map(|e| e.deadline) {
                    Some(deadline) if deadline <= Utc::now() => {
                        if let Some(entry) = pending.heap.pop() {
                            return entry.item;
                        }
                        None
                    }
                    Some(deadline) => Some((deadline - Utc::now()).to_std().unwrap_or_default()),
                    None => None,
                }
            };
            match wait {
                Some(d) => {
                    tokio::select! {
                        _ = tokio::time::sleep(d) => {}
                        _ = self.wake.notified() => {}
                    }
                }
                None => self.wake.notified().await,
            }
        }
    }
}

/// Resolves with `true` once shutdown is requested (or the sender is gone),
/// `false` on any other change.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) -> bool {
    match shutdown.changed().await {
        Ok(()) => *shutdown.borrow(),
        Err(_) => true,
    }
}
