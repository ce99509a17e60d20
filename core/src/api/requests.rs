use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{FailureTag, Migration, MigrationStatus, MigrationType};

/// Explicit, typed input for [`super::FormHandlerApi::create_migration`]
/// (§6.1, §9 re-architecture away from mass-assignment). Every field the
/// handler needs is named here; nothing is pulled off a generic params map.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateMigrationRequest {
    pub did: String,
    pub email: String,
    pub old_handle: String,
    pub new_handle: String,
    pub old_pds_host: String,
    pub new_pds_host: String,
    pub old_password: String,
    pub invite_code: Option<String>,
    pub migration_type: MigrationType,
    pub create_backup_bundle: bool,
}

/// Narrow, public-safe projection of a [`Migration`] (§6.1 `get_status`).
/// Deliberately excludes every `Encrypted<T>` field: the status page has
/// no business showing ciphertext, and a view type makes that structural
/// rather than a per-field redaction a future change could forget.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatusView {
    pub token: String,
    pub did: String,
    pub old_handle: String,
    pub new_handle: String,
    pub status: MigrationStatus,
    pub migration_type: MigrationType,
    pub failure_tag: Option<FailureTag>,
    pub progress_percentage: u8,
    pub estimated_time_remaining_secs: Option<i64>,
    pub blob_count: u64,
    pub blobs_uploaded: u64,
    pub bytes_transferred: u64,
    pub last_error: Option<String>,
    pub retry_count: i32,
    pub can_cancel: bool,
    pub backup_available: bool,
    pub backup_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Migration> for MigrationStatusView {
    fn from(m: &Migration) -> Self {
        let backup_available = m.backup_bundle_path.is_some()
            && m.backup_expires_at.map(|exp| exp > Utc::now()).unwrap_or(false);
        let blob_count = m.progress_data.get_counter("blob_count").unwrap_or(0);
        let blobs_uploaded = m.progress_data.get_counter("blobs_completed").unwrap_or(0);
        // Rate-based ETA would need a client-tracked transfer rate the
        // source never persists server-side; left unestimated (§9 does not
        // call for inventing one).
        let estimated_time_remaining_secs = None;
        Self {
            token: m.token.clone(),
            did: m.did.clone(),
            old_handle: m.old_handle.clone(),
            new_handle: m.new_handle.clone(),
            status: m.status,
            migration_type: m.migration_type,
            failure_tag: m.failure_tag,
            progress_percentage: m.status.progress_percentage(),
            estimated_time_remaining_secs,
            blob_count,
            blobs_uploaded,
            bytes_transferred: m.progress_data.get_counter("bytes_transferred").unwrap_or(0),
            last_error: m.last_error.clone(),
            retry_count: m.retry_count,
            can_cancel: m.status.can_cancel(),
            backup_available,
            backup_expires_at: m.backup_expires_at,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}
