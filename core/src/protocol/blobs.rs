use std::path::Path;

use tokio::io::AsyncWriteExt;
use tracing::instrument;

use super::errors::{error_from_response, ClientError};
use super::types::ListBlobsPage;

/// Cursor-paginated blob enumeration; terminates when the cursor comes
/// back empty/absent (§4.3 `list_blobs`).
#[instrument(skip(http_client), err)]
pub async fn list_blobs(
    http_client: &reqwest::Client,
    pds_url: &str,
    did: &str,
    cursor: Option<&str>,
) -> Result<ListBlobsPage, ClientError> {
    let mut url = format!("{pds_url}/xrpc/com.atproto.sync.listBlobs?did={did}&limit=500");
    if let Some(cursor) = cursor {
        url.push_str(&format!("&cursor={cursor}"));
    }

    let response = http_client
        .get(&url)
        .send()
        .await
        .map_err(|e| ClientError::NetworkError {
            message: format!("listBlobs request failed: {e}"),
        })?;

    if !response.status().is_success() {
        return Err(error_from_response(response, "listBlobs").await);
    }

    let data: serde_json::Value = response.json().await.map_err(|e| ClientError::NetworkError {
        message: format!("failed to parse listBlobs response: {e}"),
    })?;

    let cids = data["cids"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(|cid| super::types::BlobDescriptor {
                    cid: cid.to_string(),
                    size: None,
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(ListBlobsPage {
        cids,
        cursor: data["cursor"].as_str().map(String::from),
    })
}

/// `getBlob` is treated as public; no auth required (§4.3 per-operation
/// invariants).
#[instrument(skip(http_client), err)]
pub async fn download_blob(
    http_client: &reqwest::Client,
    pds_url: &str,
    did: &str,
    cid: &str,
    dest_path: &Path,
) -> Result<u64, ClientError> {
    let url = format!("{pds_url}/xrpc/com.atproto.sync.getBlob?did={did}&cid={cid}");
    let response = http_client
        .get(&url)
        .send()
        .await
        .map_err(|e| ClientError::NetworkError {
            message: format!("getBlob request failed: {e}"),
        })?;

    if !response.status().is_success() {
        return Err(error_from_response(response, "getBlob").await);
    }

    let bytes = response.bytes().await.map_err(|e| ClientError::NetworkError {
        message: format!("getBlob body read failed: {e}"),
    })?;

    let mut file = tokio::fs::File::create(dest_path)
        .await
        .map_err(|e| ClientError::StorageError {
            message: format!("failed to create {}: {e}", dest_path.display()),
        })?;
    file.write_all(&bytes)
        .await
        .map_err(|e| ClientError::StorageError {
            message: format!("failed to write blob: {e}"),
        })?;

    Ok(bytes.len() as u64)
}

/// `uploadBlob` requires a target session (§4.3 per-operation invariants).
#[instrument(skip(http_client, access_jwt), err)]
pub async fn upload_blob(
    http_client: &reqwest::Client,
    pds_url: &str,
    access_jwt: &str,
    local_path: &Path,
) -> Result<(), ClientError> {
    let url = format!("{pds_url}/xrpc/com.atproto.repo.uploadBlob");
    let bytes = tokio::fs::read(local_path)
        .await
        .map_err(|e| ClientError::StorageError {
            message: format!("failed to read {}: {e}", local_path.display()),
        })?;

    let response = http_client
        .post(&url)
        .bearer_auth(access_jwt)
        .header("Content-Type", "application/octet-stream")
        .body(bytes)
        .send()
        .await
        .map_err(|e| ClientError::NetworkError {
            message: format!("uploadBlob request failed: {e}"),
        })?;

    if !response.status().is_success() {
        return Err(error_from_response(response, "uploadBlob").await);
    }
    Ok(())
}

/// §4.2/§4.6: after the blob phase, the target can be asked which of the
/// expected CIDs are still missing, used by the reconciliation pass.
#[instrument(skip(http_client), err)]
pub async fn get_missing_blobs(
    http_client: &reqwest::Client,
    pds_url: &str,
    access_jwt: &str,
) -> Result<Vec<String>, ClientError> {
    let url = format!("{pds_url}/xrpc/com.atproto.repo.listMissingBlobs?limit=1000");
    let response = http_client
        .get(&url)
        .bearer_auth(access_jwt)
        .send()
        .await
        .map_err(|e| ClientError::NetworkError {
            message: format!("listMissingBlobs request failed: {e}"),
        })?;

    if !response.status().is_success() {
        return Err(error_from_response(response, "listMissingBlobs").await);
    }

    let data: serde_json::Value = response.json().await.map_err(|e| ClientError::NetworkError {
        message: format!("failed to parse listMissingBlobs response: {e}"),
    })?;

    Ok(data["blobs"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v["cid"].as_str())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default())
}
