use std::cmp::Ordering;
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

/// §4.2 queues: critical=10, migrations=5, default=3, low=1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueuePriority {
    Low = 1,
    Default = 3,
    Migrations = 5,
    Critical = 10,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: u64,
    pub migration_id: i64,
    pub step: String,
    pub priority: QueuePriority,
    pub enqueued_at: DateTime<Utc>,
    pub run_at: DateTime<Utc>,
    pub attempt: u32,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    /// Max-heap by priority, then earliest `run_at` first, then FIFO by
    /// `enqueued_at` as a final tiebreak.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.run_at.cmp(&self.run_at))
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
    }
}

/// Durable work-queue store is out of scope (§1); this in-process priority
/// heap is the shape a durable implementation would present to workers.
pub struct JobQueue {
    heap: Mutex<BinaryHeap<Job>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    pub async fn enqueue(&self, migration_id: i64, step: &str, priority: QueuePriority) -> u64 {
        self.enqueue_delayed(migration_id, step, priority, chrono::Duration::zero())
            .await
    }

    pub async fn enqueue_delayed(
        &self,
        migration_id: i64,
        step: &str,
        priority: QueuePriority,
        delay: chrono::Duration,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let now = Utc::now();
        let job = Job {
            id,
            migration_id,
            step: step.to_string(),
            priority,
            enqueued_at: now,
            run_at: now + delay,
            attempt: 0,
        };
        self.heap.lock().await.push(job);
        id
    }

    /// Pops the highest-priority job whose `run_at` has elapsed, if any.
    /// Jobs not yet due are left in the heap for a later poll.
    pub async fn dequeue_ready(&self) -> Option<Job> {
        let mut heap = self.heap.lock().await;
        let now = Utc::now();
        if heap.peek().map(|j| j.run_at <= now).unwrap_or(false) {
            heap.pop()
        } else {
            None
        }
    }

    pub async fn len(&self) -> usize {
        self.heap.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn higher_priority_dequeues_first() {
        let q = JobQueue::new();
        q.enqueue(1, "import_blobs", QueuePriority::Default).await;
        q.enqueue(2, "submit_directory_op", QueuePriority::Critical).await;
        let job = q.dequeue_ready().await.unwrap();
        assert_eq!(job.migration_id, 2);
    }

    #[tokio::test]
    async fn delayed_job_is_not_ready_immediately() {
        let q = JobQueue::new();
        q.enqueue_delayed(1, "import_blobs", QueuePriority::Default, chrono::Duration::seconds(30))
            .await;
        assert!(q.dequeue_ready().await.is_none());
        assert_eq!(q.len().await, 1);
    }
}
