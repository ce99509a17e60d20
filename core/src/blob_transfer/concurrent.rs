use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures_util::stream::{self, StreamExt};
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use crate::jobs::backoff::{sleep_backoff, streamed_blob_backoff};
use crate::protocol::{ClientError, PdsClient};

use super::progress::{ProgressSink, ProgressTracker};

/// Fixed-size worker pool size for both download and upload passes (§4.5,
/// §5: "Blob engine worker pool size: 10 (download), 10 (upload)").
pub const DEFAULT_POOL_SIZE: usize = 10;
const MAX_ATTEMPTS: u32 = 3;

/// §4.5 two-phase mode: a prior job downloads all blobs concurrently into
/// a local directory with a fixed-size worker pool, then a later job
/// uploads from disk with the same pool size. Used when
/// `create_backup_bundle == true`.
pub struct ConcurrentBlobMigration<'a> {
    pub client: &'a PdsClient,
    pub source_pds: &'a str,
    pub target_pds: &'a str,
    pub did: &'a str,
    pub target_access_jwt: &'a str,
    pub work_dir: &'a Path,
    pub pool_size: usize,
    pub progress_sink: Option<&'a dyn ProgressSink>,
}

pub struct DownloadPhaseResult {
    pub downloaded: Vec<(String, PathBuf, u64)>,
    pub missing_blobs: Vec<String>,
}

pub struct UploadPhaseResult {
    pub uploaded: u32,
    pub bytes_transferred: u64,
    pub failed_blobs: Vec<String>,
}

impl<'a> ConcurrentBlobMigration<'a> {
    #[instrument(skip(self), err)]
    pub async fn download_all(&self) -> Result<DownloadPhaseResult, ClientError> {
        let blob_ids = self.client.list_all_blobs(self.source_pds, self.did).await?;
        if blob_ids.is_empty() {
            info!("blob phase: 0 enumerated blobs, completing immediately");
            return Ok(DownloadPhaseResult {
                downloaded: Vec::new(),
                missing_blobs: Vec::new(),
            });
        }

        let semaphore = Arc::new(Semaphore::new(self.pool_size));
        let tracker = ProgressTracker::new();
        let downloaded = Mutex::new(Vec::new());
        let missing_blobs = Mutex::new(Vec::new());

        stream::iter(blob_ids.into_iter())
            .for_each_concurrent(self.pool_size, |descriptor| {
                let semaphore = semaphore.clone();
                let client = self.client;
                let source_pds = self.source_pds;
                let did = self.did;
                let work_dir = self.work_dir.to_path_buf();
                let tracker = &tracker;
                let downloaded = &downloaded;
                let missing_blobs = &missing_blobs;
                let progress_sink = self.progress_sink;
                async move {
                    let _permit = semaphore.acquire().await.expect("semaphore closed");
                    let cid = descriptor.cid.clone();
                    let local_path = work_dir.join(format!("blob-{cid}"));
                    match download_with_retry(client, source_pds, did, &cid, &local_path).await {
                        Ok(size) => {
                            tracker.record_success(size);
                            downloaded.lock().unwrap().push((cid, local_path, size));
                        }
                        Err(e) => {
                            warn!(cid, error = %e, "blob download exhausted retry budget");
                            tracker.record_failure(cid.clone());
                            missing_blobs.lock().unwrap().push(cid);
                        }
                    }
                    if tracker.should_snapshot() {
                        if let Some(sink) = progress_sink {
                            sink.on_progress(&tracker.snapshot()).await;
                        }
                    }
                }
            })
            .await;

        let downloaded = downloaded.into_inner().unwrap();
        let missing_blobs = missing_blobs.into_inner().unwrap();

        if !missing_blobs.is_empty() {
            write_missing_blobs_manifest(self.work_dir, &missing_blobs).await;
        }

        Ok(DownloadPhaseResult {
            downloaded,
            missing_blobs,
        })
    }

    #[instrument(skip(self, downloaded), err)]
    pub async fn upload_all(
        &self,
        downloaded: &[(String, PathBuf, u64)],
    ) -> Result<UploadPhaseResult, ClientError> {
        let tracker = ProgressTracker::new();
        let semaphore = Arc::new(Semaphore::new(self.pool_size));

        stream::iter(downloaded.iter().cloned())
            .map(|(cid, path, size)| {
                let semaphore = semaphore.clone();
                let client = self.client;
                let target_pds = self.target_pds;
                let target_access_jwt = self.target_access_jwt;
                let tracker = &tracker;
                let progress_sink = self.progress_sink;
                async move {
                    let _permit = semaphore.acquire().await.expect("semaphore closed");
                    match upload_with_retry(client, target_pds, target_access_jwt, &path).await {
                        Ok(()) => tracker.record_success(size),
                        Err(e) => {
                            warn!(cid, error = %e, "blob upload exhausted retry budget");
                            tracker.record_failure(cid.clone());
                        }
                    }
                    let _ = tokio::fs::remove_file(&path).await;
                    if tracker.should_snapshot() {
                        if let Some(sink) = progress_sink {
                            sink.on_progress(&tracker.snapshot()).await;
                        }
                    }
                }
            })
            .buffer_unordered(self.pool_size)
            .collect::<Vec<()>>()
            .await;

        let snapshot = tracker.snapshot();
        Ok(UploadPhaseResult {
            uploaded: snapshot.completed_blobs,
            bytes_transferred: snapshot.completed_bytes,
            failed_blobs: snapshot.failed_blobs,
        })
    }
}

async fn download_with_retry(
    client: &PdsClient,
    source_pds: &str,
    did: &str,
    cid: &str,
    local_path: &Path,
) -> Result<u64, ClientError> {
    let mut last_err = None;
    for attempt in 0..MAX_ATTEMPTS {
        match client.download_blob(source_pds, did, cid, local_path).await {
            Ok(size) => return Ok(size),
            Err(e) => {
                let backoff = if matches!(e, ClientError::RateLimited { .. }) {
                    crate::jobs::backoff::blob_rate_limit_backoff(attempt)
                } else {
                    streamed_blob_backoff(attempt)
                };
                last_err = Some(e);
                sleep_backoff(backoff).await;
            }
        }
    }
    Err(last_err.unwrap())
}

async fn upload_with_retry(
    client: &PdsClient,
    target_pds: &str,
    target_access_jwt: &str,
    local_path: &Path,
) -> Result<(), ClientError> {
    let mut last_err = None;
    for attempt in 0..MAX_ATTEMPTS {
        match client.upload_blob(target_pds, target_access_jwt, local_path).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                let backoff = if matches!(e, ClientError::RateLimited { .. }) {
                    crate::jobs::backoff::blob_rate_limit_backoff(attempt)
                } else {
                    streamed_blob_backoff(attempt)
                };
                last_err = Some(e);
                sleep_backoff(backoff).await;
            }
        }
    }
    Err(last_err.unwrap())
}

/// §4.5 "A missing-blobs manifest file is written on partial download
/// failure", reused verbatim as `MISSING_BLOBS.txt` inside the backup
/// bundle (§6.3).
async fn write_missing_blobs_manifest(work_dir: &Path, missing: &[String]) {
    let manifest_path = work_dir.join("MISSING_BLOBS.txt");
    let contents = missing.join("\n");
    if let Err(e) = tokio::fs::write(&manifest_path, contents).await {
        warn!(error = %e, "failed to write missing-blobs manifest");
    }
}
