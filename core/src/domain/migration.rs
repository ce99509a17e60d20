use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::vault::Encrypted;

/// State-machine cursor (§3.4). Ordered; `Failed` is an orthogonal terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    PendingDownload,
    PendingBackup,
    BackupReady,
    PendingAccount,
    PendingRepo,
    PendingBlobs,
    PendingPrefs,
    PendingPlc,
    PendingActivation,
    Completed,
    Failed,
}

impl MigrationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, MigrationStatus::Completed | MigrationStatus::Failed)
    }

    /// Position in the declared phase order (§3.4), used for the status
    /// page's coarse `progress_percentage` (§6.1 `get_status`). `Failed` has
    /// no fixed position; callers report whatever percentage had been
    /// reached before failure via `progress_data`, not this ordinal.
    fn ordinal(self) -> u8 {
        use MigrationStatus::*;
        match self {
            PendingDownload => 0,
            PendingBackup => 1,
            BackupReady => 2,
            PendingAccount => 3,
            PendingRepo => 4,
            PendingBlobs => 5,
            PendingPrefs => 6,
            PendingPlc => 7,
            PendingActivation => 8,
            Completed => 9,
            Failed => 9,
        }
    }

    /// Coarse 0-100 percentage for the status page (§6.1). `Completed`
    /// always reports 100; `Failed` reports the percentage of its
    /// last-reached non-terminal phase.
    pub fn progress_percentage(self) -> u8 {
        const TOTAL: u8 = 9;
        if matches!(self, MigrationStatus::Completed) {
            return 100;
        }
        ((self.ordinal() as u32 * 100) / TOTAL as u32) as u8
    }

    /// §4.1 `can_cancel`: true iff strictly before `pending_plc` and not terminal.
    pub fn can_cancel(self) -> bool {
        !self.is_terminal() && self < MigrationStatus::PendingPlc
    }

    /// Recovers a status from its `{:?}` form, used to restore the status a
    /// migration was in before `mark_failed` overwrote it with `Failed`
    /// (§6.6 `retry` operator surface).
    pub fn from_debug_str(s: &str) -> Option<Self> {
        use MigrationStatus::*;
        Some(match s {
            "PendingDownload" => PendingDownload,
            "PendingBackup" => PendingBackup,
            "BackupReady" => BackupReady,
            "PendingAccount" => PendingAccount,
            "PendingRepo" => PendingRepo,
            "PendingBlobs" => PendingBlobs,
            "PendingPrefs" => PendingPrefs,
            "PendingPlc" => PendingPlc,
            "PendingActivation" => PendingActivation,
            "Completed" => Completed,
            "Failed" => Failed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationType {
    /// Creating a fresh account on a different host.
    MigrationOut,
    /// Returning to a pre-existing account on a well-known host.
    MigrationIn,
}

/// Whether a terminal-`Failed` migration was reached via user cancellation,
/// reported distinctly from the status page (§7 "User-visible behavior").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureTag {
    Error,
    Cancelled,
}

/// Semi-structured progress map (§3.3). Stored as a JSON column; well-known
/// keys are accessed through typed helpers so callers don't hand-roll key
/// strings at every call site.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressData(pub BTreeMap<String, Value>);

impl ProgressData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_timestamp(&mut self, key: &str, at: DateTime<Utc>) {
        self.0.insert(key.to_string(), Value::String(at.to_rfc3339()));
    }

    pub fn get_timestamp(&self, key: &str) -> Option<DateTime<Utc>> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn set_counter(&mut self, key: &str, value: u64) {
        self.0.insert(key.to_string(), Value::from(value));
    }

    pub fn get_counter(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    pub fn set_failed_blobs(&mut self, key: &str, ids: &[String]) {
        self.0.insert(key.to_string(), serde_json::json!(ids));
    }

    pub fn get_failed_blobs(&self, key: &str) -> Vec<String> {
        self.0
            .get(key)
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_string(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_string(), Value::String(value.into()));
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.0.get(key).and_then(Value::as_str).map(String::from)
    }
}

/// The durable record of one user's transfer attempt (§3.1 root aggregate).
#[derive(Debug, Clone)]
pub struct Migration {
    pub id: i64,
    pub token: String,
    pub did: String,
    pub email: String,
    pub old_handle: String,
    pub new_handle: String,
    pub old_pds_host: String,
    pub new_pds_host: String,
    pub status: MigrationStatus,
    pub migration_type: MigrationType,
    pub progress_data: ProgressData,
    pub estimated_memory_mb: i64,

    pub old_password: Encrypted<String>,
    pub old_access_jwt: Encrypted<String>,
    pub old_refresh_jwt: Encrypted<String>,
    pub new_access_jwt: Encrypted<String>,
    pub new_refresh_jwt: Encrypted<String>,
    pub directory_one_time_token: Encrypted<String>,
    pub invite_code: Encrypted<String>,
    pub rotation_private_key: Encrypted<String>,

    pub backup_bundle_path: Option<String>,
    pub backup_created_at: Option<DateTime<Utc>>,
    pub backup_expires_at: Option<DateTime<Utc>>,

    pub downloaded_data_path: Option<String>,

    pub last_error: Option<String>,
    pub retry_count: i32,
    pub current_job_step: Option<String>,
    pub current_job_attempt: i32,
    pub current_job_max_attempts: i32,

    pub email_verified_at: Option<DateTime<Utc>>,
    pub email_verification_token: Option<String>,

    pub create_backup_bundle: bool,
    pub failure_tag: Option<FailureTag>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Migration {
    /// Purges every encrypted credential field (§3.1 invariant, §4.1 `mark_complete`).
    pub fn purge_credentials(&mut self) {
        self.old_password = Encrypted::empty();
        self.old_access_jwt = Encrypted::empty();
        self.old_refresh_jwt = Encrypted::empty();
        self.new_access_jwt = Encrypted::empty();
        self.new_refresh_jwt = Encrypted::empty();
        self.directory_one_time_token = Encrypted::empty();
        self.invite_code = Encrypted::empty();
        // rotation_private_key is retained (delivered to the user once, §3.2).
    }

    pub fn purge_directory_token(&mut self) {
        self.directory_one_time_token = Encrypted::empty();
    }
}
