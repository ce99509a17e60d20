use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, instrument};
use zip::write::FileOptions;
use zip::ZipWriter;

use crate::domain::Migration;
use crate::error::{MigrationError, Result, StorageError};

/// Retention window for a built bundle (§6.3: "24h from creation").
pub fn expiry_from(created_at: DateTime<Utc>) -> DateTime<Utc> {
    created_at + Duration::hours(24)
}

#[derive(Serialize)]
struct BackupMetadata<'a> {
    migration_token: &'a str,
    did: &'a str,
    old_handle: &'a str,
    new_handle: &'a str,
    old_pds_host: &'a str,
    new_pds_host: &'a str,
    created_at: DateTime<Utc>,
    repo_size_bytes: u64,
    blob_count: usize,
    instructions: &'static str,
}

const INSTRUCTIONS: &str = "This archive is a point-in-time copy of your account's \
repository and blobs, downloaded before the migration proceeded. repo.car is a \
binary content-addressed repository archive; blobs/ holds every attachment that \
was successfully downloaded. Retain it somewhere safe — it is deleted from this \
server 24 hours after creation.";

/// Builds the §6.3 ZIP bundle: `metadata.json`, `repo.car`, one entry per
/// successfully downloaded blob under `blobs/`, and an optional
/// `MISSING_BLOBS.txt` when any blob failed to download.
#[instrument(skip(migration, downloaded_blobs), err)]
pub async fn build_bundle(
    migration: &Migration,
    repo_car_path: &Path,
    downloaded_blobs: &[(String, PathBuf)],
    missing_blobs: &[String],
    dest_dir: &Path,
) -> Result<(PathBuf, DateTime<Utc>)> {
    let created_at = Utc::now();
    let bundle_path = dest_dir.join(format!("{}-backup.zip", migration.token));

    let repo_bytes = tokio::fs::read(repo_car_path)
        .await
        .map_err(|e| storage_err(format!("failed to read repo archive: {e}")))?;

    let mut blob_entries = Vec::with_capacity(downloaded_blobs.len());
    for (cid, path) in downloaded_blobs {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| storage_err(format!("failed to read blob {cid}: {e}")))?;
        blob_entries.push((cid.clone(), bytes));
    }

    let metadata = BackupMetadata {
        migration_token: &migration.token,
        did: &migration.did,
        old_handle: &migration.old_handle,
        new_handle: &migration.new_handle,
        old_pds_host: &migration.old_pds_host,
        new_pds_host: &migration.new_pds_host,
        created_at,
        repo_size_bytes: repo_bytes.len() as u64,
        blob_count: blob_entries.len(),
        instructions: INSTRUCTIONS,
    };
    let metadata_json = serde_json::to_vec_pretty(&metadata)
        .map_err(|e| storage_err(format!("failed to serialize bundle metadata: {e}")))?;

    let missing_blobs = missing_blobs.to_vec();
    let bundle_path_clone = bundle_path.clone();
    tokio::task::spawn_blocking(move || {
        write_zip_blocking(&bundle_path_clone, &metadata_json, &repo_bytes, &blob_entries, &missing_blobs)
    })
    .await
    .map_err(|e| storage_err(format!("bundle writer task panicked: {e}")))??;

    info!(path = %bundle_path.display(), blobs = metadata.blob_count, "backup bundle built");
    Ok((bundle_path, created_at))
}

fn write_zip_blocking(
    bundle_path: &Path,
    metadata_json: &[u8],
    repo_bytes: &[u8],
    blob_entries: &[(String, Vec<u8>)],
    missing_blobs: &[String],
) -> Result<()> {
    let file = std::fs::File::create(bundle_path)
        .map_err(|e| storage_err(format!("failed to create bundle file: {e}")))?;
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    zip.start_file("metadata.json", options)
        .map_err(|e| storage_err(format!("zip start_file metadata.json: {e}")))?;
    zip.write_all(metadata_json)
        .map_err(|e| storage_err(format!("zip write metadata.json: {e}")))?;

    zip.start_file("repo.car", options)
        .map_err(|e| storage_err(format!("zip start_file repo.car: {e}")))?;
    zip.write_all(repo_bytes)
        .map_err(|e| storage_err(format!("zip write repo.car: {e}")))?;

    for (cid, bytes) in blob_entries {
        zip.start_file(format!("blobs/{cid}"), options)
            .map_err(|e| storage_err(format!("zip start_file blobs/{cid}: {e}")))?;
        zip.write_all(bytes)
            .map_err(|e| storage_err(format!("zip write blobs/{cid}: {e}")))?;
    }

    if !missing_blobs.is_empty() {
        zip.start_file("MISSING_BLOBS.txt", options)
            .map_err(|e| storage_err(format!("zip start_file MISSING_BLOBS.txt: {e}")))?;
        zip.write_all(missing_blobs.join("\n").as_bytes())
            .map_err(|e| storage_err(format!("zip write MISSING_BLOBS.txt: {e}")))?;
    }

    zip.finish()
        .map_err(|e| storage_err(format!("zip finish: {e}")))?;
    Ok(())
}

fn storage_err(message: String) -> MigrationError {
    MigrationError::Storage {
        source: StorageError::Backend(message),
        context: "backup bundle".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn expiry_is_24h_after_creation() {
        let created = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let expires = expiry_from(created);
        assert_eq!(expires - created, Duration::hours(24));
    }
}
