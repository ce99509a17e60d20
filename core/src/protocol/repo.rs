use std::path::Path;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tracing::{info, instrument, warn};

use super::errors::{error_from_response, ClientError};

/// §4.3 per-operation invariant: abort the export if the running average
/// throughput drops below this floor for a continuous stretch of
/// `THROUGHPUT_GRACE_PERIOD`.
const MIN_THROUGHPUT_BYTES_PER_SEC: f64 = 1024.0;
const THROUGHPUT_GRACE_PERIOD: Duration = Duration::from_secs(60);

/// Exports the DID's repository as a binary CAR archive, streamed straight
/// to disk (§4.3 `export_repo`, §4.3 per-operation invariants: single
/// streamed binary).
#[instrument(skip(http_client), err)]
pub async fn export_repository(
    http_client: &reqwest::Client,
    pds_url: &str,
    did: &str,
    access_jwt: &str,
    dest_path: &Path,
) -> Result<u64, ClientError> {
    let url = format!("{pds_url}/xrpc/com.atproto.sync.getRepo?did={did}");

    let response = http_client
        .get(&url)
        .bearer_auth(access_jwt)
        .header("Accept-Encoding", "gzip, deflate")
        .send()
        .await
        .map_err(|e| ClientError::NetworkError {
            message: format!("getRepo request failed: {e}"),
        })?;

    if !response.status().is_success() {
        return Err(error_from_response(response, "getRepo").await);
    }

    let mut file = tokio::fs::File::create(dest_path)
        .await
        .map_err(|e| ClientError::StorageError {
            message: format!("failed to create {}: {e}", dest_path.display()),
        })?;

    let mut stream = response.bytes_stream();
    let mut total: u64 = 0;
    let transfer_start = Instant::now();
    let mut low_throughput_since: Option<Instant> = None;
    use futures_util::StreamExt;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ClientError::NetworkError {
            message: format!("getRepo stream error: {e}"),
        })?;
        total += chunk.len() as u64;
        file.write_all(&chunk)
            .await
            .map_err(|e| ClientError::StorageError {
                message: format!("failed to write repo chunk: {e}"),
            })?;

        let elapsed = transfer_start.elapsed();
        let rate = total as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
        if rate < MIN_THROUGHPUT_BYTES_PER_SEC {
            let stalled_since = *low_throughput_since.get_or_insert(Instant::now());
            if stalled_since.elapsed() >= THROUGHPUT_GRACE_PERIOD {
                warn!(rate, "repo export throughput below floor for over 60s, aborting");
                return Err(ClientError::PdsOperationFailed {
                    operation: "getRepo".to_string(),
                    message: format!(
                        "sustained throughput below {MIN_THROUGHPUT_BYTES_PER_SEC:.0} B/s for over {}s",
                        THROUGHPUT_GRACE_PERIOD.as_secs()
                    ),
                });
            }
        } else {
            low_throughput_since = None;
        }
    }
    file.flush().await.ok();

    if total == 0 {
        return Err(ClientError::PdsOperationFailed {
            operation: "getRepo".to_string(),
            message: "empty repository archive".to_string(),
        });
    }

    info!(bytes = total, "repository exported");
    Ok(total)
}

/// Imports a CAR archive into the target via `com.atproto.repo.importRepo`.
/// Content-Length is required (§4.3's api/repo.rs notes this explicitly);
/// no compression is applied on upload.
#[instrument(skip(http_client), err)]
pub async fn import_repository(
    http_client: &reqwest::Client,
    pds_url: &str,
    access_jwt: &str,
    car_path: &Path,
) -> Result<(), ClientError> {
    let url = format!("{pds_url}/xrpc/com.atproto.repo.importRepo");
    let bytes = tokio::fs::read(car_path)
        .await
        .map_err(|e| ClientError::StorageError {
            message: format!("failed to read {}: {e}", car_path.display()),
        })?;
    let content_length = bytes.len();

    let response = http_client
        .post(&url)
        .bearer_auth(access_jwt)
        .header("Content-Type", "application/vnd.ipld.car")
        .header("Content-Length", content_length.to_string())
        .body(bytes)
        .send()
        .await
        .map_err(|e| ClientError::NetworkError {
            message: format!("importRepo request failed: {e}"),
        })?;

    if !response.status().is_success() {
        return Err(error_from_response(response, "importRepo").await);
    }
    info!(content_length, "repository imported");
    Ok(())
}
