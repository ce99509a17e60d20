use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;

/// Shared counters protected by a single mutex (§4.5 concurrency contract).
/// Progress snapshots taken under the mutex are monotonic per (count,
/// bytes) even though individual blob completions are unordered (§5).
pub struct ProgressTracker {
    completed_blobs: AtomicU32,
    completed_bytes: AtomicU64,
    failed: Mutex<Vec<String>>,
    start: Instant,
    last_snapshot_count: AtomicU32,
}

#[derive(Debug, Clone)]
pub struct BlobProgressSnapshot {
    pub completed_blobs: u32,
    pub completed_bytes: u64,
    pub failed_blobs: Vec<String>,
}

/// Snapshot cadence (§4.5 streamed: "updated every N blobs, default 10";
/// §4.5 two-phase: "written... every 10 completions and at end").
const SNAPSHOT_EVERY: u32 = 10;

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            completed_blobs: AtomicU32::new(0),
            completed_bytes: AtomicU64::new(0),
            failed: Mutex::new(Vec::new()),
            start: Instant::now(),
            last_snapshot_count: AtomicU32::new(0),
        }
    }

    pub fn record_success(&self, bytes: u64) {
        self.completed_blobs.fetch_add(1, Ordering::SeqCst);
        self.completed_bytes.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn record_failure(&self, blob_id: String) {
        self.failed.lock().unwrap().push(blob_id);
    }

    /// Whether a periodic progress write is due, given the snapshot cadence.
    pub fn should_snapshot(&self) -> bool {
        let count = self.completed_blobs.load(Ordering::SeqCst);
        let last = self.last_snapshot_count.load(Ordering::SeqCst);
        if count > 0 && count - last >= SNAPSHOT_EVERY {
            self.last_snapshot_count.store(count, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> BlobProgressSnapshot {
        BlobProgressSnapshot {
            completed_blobs: self.completed_blobs.load(Ordering::SeqCst),
            completed_bytes: self.completed_bytes.load(Ordering::SeqCst),
            failed_blobs: self.failed.lock().unwrap().clone(),
        }
    }

    pub fn throughput_bytes_per_sec(&self) -> f64 {
        let elapsed = self.start.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.completed_bytes.load(Ordering::SeqCst) as f64 / elapsed
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Mid-phase persistence hook (§4.5: progress snapshots are written to the
/// migration record periodically, not only once the whole phase finishes).
/// The blob engines stay storage-agnostic; the orchestrator phase that owns
/// the repository handle supplies the implementation.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn on_progress(&self, snapshot: &BlobProgressSnapshot);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_cadence_fires_every_n() {
        let tracker = ProgressTracker::new();
        for _ in 0..9 {
            tracker.record_success(10);
            assert!(!tracker.should_snapshot());
        }
        tracker.record_success(10);
        assert!(tracker.should_snapshot());
    }

    #[test]
    fn failed_blobs_recorded_without_failing_tracker() {
        let tracker = ProgressTracker::new();
        tracker.record_failure("B5".to_string());
        tracker.record_success(1024);
        let snap = tracker.snapshot();
        assert_eq!(snap.failed_blobs, vec!["B5".to_string()]);
        assert_eq!(snap.completed_blobs, 1);
    }
}
