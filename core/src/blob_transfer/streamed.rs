use std::path::Path;

use tracing::{info, instrument, warn};

use crate::jobs::backoff::{sleep_backoff, streamed_blob_backoff};
use crate::protocol::{ClientError, PdsClient};

use super::progress::{ProgressSink, ProgressTracker};

/// §4.5 streamed mode: strictly sequential download -> upload -> delete,
/// one blob resident at a time. Used when `create_backup_bundle == false`
/// — the documented memory-safe default path.
pub struct StreamedBlobMigration<'a> {
    pub client: &'a PdsClient,
    pub source_pds: &'a str,
    pub target_pds: &'a str,
    pub did: &'a str,
    pub target_access_jwt: &'a str,
    pub work_dir: &'a Path,
    pub progress_sink: Option<&'a dyn ProgressSink>,
}

pub struct StreamedResult {
    pub blob_count: usize,
    pub completed_blobs: u32,
    pub bytes_transferred: u64,
    pub failed_blobs: Vec<String>,
}

/// Reclamation hint cadence (§4.5: "explicit reclamation hint every M
/// blobs, default 50").
const RECLAIM_EVERY: usize = 50;
const MAX_ATTEMPTS: u32 = 3;

impl<'a> StreamedBlobMigration<'a> {
    #[instrument(skip(self), err)]
    pub async fn run(&self) -> Result<StreamedResult, ClientError> {
        let blob_ids = self.client.list_all_blobs(self.source_pds, self.did).await?;
        let tracker = ProgressTracker::new();

        if blob_ids.is_empty() {
            info!("blob phase: 0 enumerated blobs, completing immediately");
            return Ok(StreamedResult {
                blob_count: 0,
                completed_blobs: 0,
                bytes_transferred: 0,
                failed_blobs: Vec::new(),
            });
        }

        for (idx, descriptor) in blob_ids.iter().enumerate() {
            self.migrate_one(&descriptor.cid, &tracker).await;

            if (idx + 1) % RECLAIM_EVERY == 0 {
                // Hint to the allocator; the temp file for this blob is
                // already removed by `migrate_one` before the next starts.
                tracker.snapshot();
            }
            if tracker.should_snapshot() {
                if let Some(sink) = self.progress_sink {
                    sink.on_progress(&tracker.snapshot()).await;
                }
            }
        }

        let snapshot = tracker.snapshot();
        Ok(StreamedResult {
            blob_count: blob_ids.len(),
            completed_blobs: snapshot.completed_blobs,
            bytes_transferred: snapshot.completed_bytes,
            failed_blobs: snapshot.failed_blobs,
        })
    }

    async fn migrate_one(&self, cid: &str, tracker: &ProgressTracker) {
        let local_path = self.work_dir.join(format!("blob-{cid}"));

        for attempt in 0..MAX_ATTEMPTS {
            let outcome = self.try_migrate_once(cid, &local_path).await;
            match outcome {
                Ok(size) => {
                    tracker.record_success(size);
                    let _ = tokio::fs::remove_file(&local_path).await;
                    return;
                }
                Err(e) if is_rate_limited(&e) => {
                    sleep_backoff(crate::jobs::backoff::blob_rate_limit_backoff(attempt)).await;
                }
                Err(e) => {
                    warn!(cid, attempt, error = %e, "blob transfer attempt failed");
                    sleep_backoff(streamed_blob_backoff(attempt)).await;
                }
            }
        }

        warn!(cid, "blob exhausted retry budget, recording as failed");
        tracker.record_failure(cid.to_string());
        let _ = tokio::fs::remove_file(&local_path).await;
    }

    async fn try_migrate_once(&self, cid: &str, local_path: &Path) -> Result<u64, ClientError> {
        let size = self
            .client
            .download_blob(self.source_pds, self.did, cid, local_path)
            .await?;
        self.client
            .upload_blob(self.target_pds, self.target_access_jwt, local_path)
            .await?;
        Ok(size)
    }
}

fn is_rate_limited(e: &ClientError) -> bool {
    matches!(e, ClientError::RateLimited { .. })
}
