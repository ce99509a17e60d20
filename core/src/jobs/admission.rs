use chrono::Duration;

use super::queue::{JobQueue, QueuePriority};

/// §4.2 global concurrency bound: at most `MAX_CONCURRENT_BLOB_MIGRATIONS`
/// migrations may be in `pending_blobs` simultaneously. This is an
/// admission-control loop, not a mutex — best-effort, may briefly over-admit.
const BLOB_PHASE_REQUEUE_DELAY_SECS: i64 = 30;

/// Returns `true` if the caller may proceed into the blob phase now. If
/// not, the caller MUST re-enqueue itself with the fixed delay and return
/// (§4.2, §8 "Admission at exactly the cap re-enqueues; admission at cap-1
/// proceeds").
pub fn admit(current_in_pending_blobs: u64, cap: u64) -> bool {
    current_in_pending_blobs < cap
}

/// Re-enqueues the blob-phase job with the fixed 30s delay when admission
/// is denied.
pub async fn requeue_for_admission(queue: &JobQueue, migration_id: i64) -> u64 {
    queue
        .enqueue_delayed(
            migration_id,
            "import_blobs",
            QueuePriority::Migrations,
            Duration::seconds(BLOB_PHASE_REQUEUE_DELAY_SECS),
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_below_cap_rejects_at_cap() {
        assert!(admit(1, 2));
        assert!(!admit(2, 2));
        assert!(!admit(3, 2));
    }
}
