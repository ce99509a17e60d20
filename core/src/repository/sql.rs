use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;

use crate::domain::migration::{FailureTag, Migration, MigrationStatus, MigrationType, ProgressData};
use crate::error::{MigrationError, Result, StorageError};
use crate::vault::Encrypted;

use super::{not_found, MigrationRepository};

/// Row shape for the `migrations` table (§6.4). One column per §3.1
/// attribute; encrypted fields are stored as opaque JSON
/// (ciphertext/nonce/expiry), never as plaintext.
#[derive(sqlx::FromRow)]
struct MigrationRow {
    id: i64,
    token: String,
    did: String,
    email: String,
    old_handle: String,
    new_handle: String,
    old_pds_host: String,
    new_pds_host: String,
    status: String,
    migration_type: String,
    progress_data: sqlx::types::Json<ProgressData>,
    estimated_memory_mb: i64,

    old_password: Json<Encrypted<String>>,
    old_access_jwt: Json<Encrypted<String>>,
    old_refresh_jwt: Json<Encrypted<String>>,
    new_access_jwt: Json<Encrypted<String>>,
    new_refresh_jwt: Json<Encrypted<String>>,
    directory_one_time_token: Json<Encrypted<String>>,
    invite_code: Json<Encrypted<String>>,
    rotation_private_key: Json<Encrypted<String>>,

    backup_bundle_path: Option<String>,
    backup_created_at: Option<DateTime<Utc>>,
    backup_expires_at: Option<DateTime<Utc>>,

    downloaded_data_path: Option<String>,

    last_error: Option<String>,
    retry_count: i32,
    current_job_step: Option<String>,
    current_job_attempt: i32,
    current_job_max_attempts: i32,

    email_verified_at: Option<DateTime<Utc>>,
    email_verification_token: Option<String>,

    create_backup_bundle: bool,
    failure_tag: Option<String>,

    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl MigrationRow {
    fn into_domain(self) -> Result<Migration> {
        Ok(Migration {
            id: self.id,
            token: self.token,
            did: self.did,
            email: self.email,
            old_handle: self.old_handle,
            new_handle: self.new_handle,
            old_pds_host: self.old_pds_host,
            new_pds_host: self.new_pds_host,
            status: parse_status(&self.status)?,
            migration_type: parse_migration_type(&self.migration_type)?,
            progress_data: self.progress_data.0,
            estimated_memory_mb: self.estimated_memory_mb,
            old_password: self.old_password.0,
            old_access_jwt: self.old_access_jwt.0,
            old_refresh_jwt: self.old_refresh_jwt.0,
            new_access_jwt: self.new_access_jwt.0,
            new_refresh_jwt: self.new_refresh_jwt.0,
            directory_one_time_token: self.directory_one_time_token.0,
            invite_code: self.invite_code.0,
            rotation_private_key: self.rotation_private_key.0,
            backup_bundle_path: self.backup_bundle_path,
            backup_created_at: self.backup_created_at,
            backup_expires_at: self.backup_expires_at,
            downloaded_data_path: self.downloaded_data_path,
            last_error: self.last_error,
            retry_count: self.retry_count,
            current_job_step: self.current_job_step,
            current_job_attempt: self.current_job_attempt,
            current_job_max_attempts: self.current_job_max_attempts,
            email_verified_at: self.email_verified_at,
            email_verification_token: self.email_verification_token,
            create_backup_bundle: self.create_backup_bundle,
            failure_tag: self.failure_tag.as_deref().map(parse_failure_tag).transpose()?.flatten(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn parse_status(s: &str) -> Result<MigrationStatus> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|e| MigrationError::Storage {
            source: StorageError::Serialization(e.to_string()),
            context: "status column".to_string(),
        })
}

fn parse_migration_type(s: &str) -> Result<MigrationType> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|e| MigrationError::Storage {
            source: StorageError::Serialization(e.to_string()),
            context: "migration_type column".to_string(),
        })
}

fn parse_failure_tag(s: &str) -> Result<Option<FailureTag>> {
    match s {
        "cancelled" => Ok(Some(FailureTag::Cancelled)),
        "error" => Ok(Some(FailureTag::Error)),
        "" => Ok(None),
        other => Err(MigrationError::Storage {
            source: StorageError::Serialization(format!("unknown failure_tag: {other}")),
            context: "failure_tag column".to_string(),
        }),
    }
}

/// Postgres-backed implementation (§6.4). Connection pooling, migrations,
/// and the database itself are the out-of-scope persistence substrate
/// (§1) — this type only issues queries against the assumed schema in
/// `core/migrations/0001_init.sql`.
pub struct PgMigrationRepository {
    pool: PgPool,
}

impl PgMigrationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MigrationRepository for PgMigrationRepository {
    async fn create(&self, migration: Migration) -> Result<Migration> {
        let row: MigrationRow = sqlx::query_as(
            r#"
            INSERT INTO migrations (
                token, did, email, old_handle, new_handle, old_pds_host, new_pds_host,
                status, migration_type, progress_data, estimated_memory_mb,
                old_password, old_access_jwt, old_refresh_jwt, new_access_jwt, new_refresh_jwt,
                directory_one_time_token, invite_code, rotation_private_key,
                backup_bundle_path, backup_created_at, backup_expires_at,
                downloaded_data_path, last_error, retry_count, current_job_step,
                current_job_attempt, current_job_max_attempts,
                email_verified_at, email_verification_token, create_backup_bundle,
                failure_tag, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30, $31,
                $32, $33, $34
            )
            RETURNING *
            "#,
        )
        .bind(&migration.token)
        .bind(&migration.did)
        .bind(&migration.email)
        .bind(&migration.old_handle)
        .bind(&migration.new_handle)
        .bind(&migration.old_pds_host)
        .bind(&migration.new_pds_host)
        .bind(status_str(migration.status))
        .bind(migration_type_str(migration.migration_type))
        .bind(Json(&migration.progress_data))
        .bind(migration.estimated_memory_mb)
        .bind(Json(&migration.old_password))
        .bind(Json(&migration.old_access_jwt))
        .bind(Json(&migration.old_refresh_jwt))
        .bind(Json(&migration.new_access_jwt))
        .bind(Json(&migration.new_refresh_jwt))
        .bind(Json(&migration.directory_one_time_token))
        .bind(Json(&migration.invite_code))
        .bind(Json(&migration.rotation_private_key))
        .bind(&migration.backup_bundle_path)
        .bind(migration.backup_created_at)
        .bind(migration.backup_expires_at)
        .bind(&migration.downloaded_data_path)
        .bind(&migration.last_error)
        .bind(migration.retry_count)
        .bind(&migration.current_job_step)
        .bind(migration.current_job_attempt)
        .bind(migration.current_job_max_attempts)
        .bind(migration.email_verified_at)
        .bind(&migration.email_verification_token)
        .bind(migration.create_backup_bundle)
        .bind(migration.failure_tag.map(failure_tag_str).unwrap_or(""))
        .bind(migration.created_at)
        .bind(migration.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| MigrationError::Storage {
            source: StorageError::Backend(e.to_string()),
            context: "insert migration".to_string(),
        })?;

        row.into_domain()
    }

    async fn load(&self, id: i64) -> Result<Migration> {
        let row: Option<MigrationRow> = sqlx::query_as("SELECT * FROM migrations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| MigrationError::Storage {
                source: StorageError::Backend(e.to_string()),
                context: "load migration".to_string(),
            })?;
        row.ok_or_else(|| not_found(&format!("migration id {id}")))?
            .into_domain()
    }

    async fn load_by_token(&self, token: &str) -> Result<Migration> {
        let row: Option<MigrationRow> =
            sqlx::query_as("SELECT * FROM migrations WHERE token = $1")
                .bind(token)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| MigrationError::Storage {
                    source: StorageError::Backend(e.to_string()),
                    context: "load migration by token".to_string(),
                })?;
        row.ok_or_else(|| not_found(&format!("migration token {token}")))?
            .into_domain()
    }

    async fn find_non_terminal_by_did(&self, did: &str) -> Result<Option<Migration>> {
        let row: Option<MigrationRow> = sqlx::query_as(
            "SELECT * FROM migrations WHERE did = $1 AND status NOT IN ('completed', 'failed') LIMIT 1",
        )
        .bind(did)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| MigrationError::Storage {
            source: StorageError::Backend(e.to_string()),
            context: "find non-terminal migration by did".to_string(),
        })?;
        row.map(MigrationRow::into_domain).transpose()
    }

    async fn update(&self, migration: &Migration) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE migrations SET
                status = $2, progress_data = $3, old_password = $4, old_access_jwt = $5,
                old_refresh_jwt = $6, new_access_jwt = $7, new_refresh_jwt = $8,
                directory_one_time_token = $9, invite_code = $10, rotation_private_key = $11,
                backup_bundle_path = $12, backup_created_at = $13, backup_expires_at = $14,
                downloaded_data_path = $15, last_error = $16, retry_count = $17,
                current_job_step = $18, current_job_attempt = $19,
                current_job_max_attempts = $20, failure_tag = $21, updated_at = $22
            WHERE id = $1
            "#,
        )
        .bind(migration.id)
        .bind(status_str(migration.status))
        .bind(Json(&migration.progress_data))
        .bind(Json(&migration.old_password))
        .bind(Json(&migration.old_access_jwt))
        .bind(Json(&migration.old_refresh_jwt))
        .bind(Json(&migration.new_access_jwt))
        .bind(Json(&migration.new_refresh_jwt))
        .bind(Json(&migration.directory_one_time_token))
        .bind(Json(&migration.invite_code))
        .bind(Json(&migration.rotation_private_key))
        .bind(&migration.backup_bundle_path)
        .bind(migration.backup_created_at)
        .bind(migration.backup_expires_at)
        .bind(&migration.downloaded_data_path)
        .bind(&migration.last_error)
        .bind(migration.retry_count)
        .bind(&migration.current_job_step)
        .bind(migration.current_job_attempt)
        .bind(migration.current_job_max_attempts)
        .bind(migration.failure_tag.map(failure_tag_str).unwrap_or(""))
        .bind(migration.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| MigrationError::Storage {
            source: StorageError::Backend(e.to_string()),
            context: "update migration".to_string(),
        })?;
        Ok(())
    }

    async fn count_in_status(&self, status: MigrationStatus) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM migrations WHERE status = $1")
                .bind(status_str(status))
                .fetch_one(&self.pool)
                .await
                .map_err(|e| MigrationError::Storage {
                    source: StorageError::Backend(e.to_string()),
                    context: "count migrations in status".to_string(),
                })?;
        Ok(count as u64)
    }

    async fn list_failed_matching(&self, needle: &str) -> Result<Vec<Migration>> {
        let rows: Vec<MigrationRow> = sqlx::query_as(
            "SELECT * FROM migrations WHERE status = 'failed' AND last_error ILIKE $1",
        )
        .bind(format!("%{needle}%"))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MigrationError::Storage {
            source: StorageError::Backend(e.to_string()),
            context: "list failed migrations".to_string(),
        })?;
        rows.into_iter().map(MigrationRow::into_domain).collect()
    }

    async fn list_expired_backups(&self, now: DateTime<Utc>) -> Result<Vec<Migration>> {
        let rows: Vec<MigrationRow> = sqlx::query_as(
            "SELECT * FROM migrations WHERE backup_bundle_path IS NOT NULL AND backup_expires_at <= $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MigrationError::Storage {
            source: StorageError::Backend(e.to_string()),
            context: "list expired backups".to_string(),
        })?;
        rows.into_iter().map(MigrationRow::into_domain).collect()
    }

    async fn list_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Migration>> {
        let rows: Vec<MigrationRow> = sqlx::query_as(
            "SELECT * FROM migrations WHERE status IN ('completed', 'failed') AND updated_at <= $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MigrationError::Storage {
            source: StorageError::Backend(e.to_string()),
            context: "list terminal migrations older than cutoff".to_string(),
        })?;
        rows.into_iter().map(MigrationRow::into_domain).collect()
    }

    async fn list_non_terminal(&self) -> Result<Vec<Migration>> {
        let rows: Vec<MigrationRow> =
            sqlx::query_as("SELECT * FROM migrations WHERE status NOT IN ('completed', 'failed')")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| MigrationError::Storage {
                    source: StorageError::Backend(e.to_string()),
                    context: "list non-terminal migrations".to_string(),
                })?;
        rows.into_iter().map(MigrationRow::into_domain).collect()
    }
}

fn status_str(status: MigrationStatus) -> &'static str {
    match status {
        MigrationStatus::PendingDownload => "pending_download",
        MigrationStatus::PendingBackup => "pending_backup",
        MigrationStatus::BackupReady => "backup_ready",
        MigrationStatus::PendingAccount => "pending_account",
        MigrationStatus::PendingRepo => "pending_repo",
        MigrationStatus::PendingBlobs => "pending_blobs",
        MigrationStatus::PendingPrefs => "pending_prefs",
        MigrationStatus::PendingPlc => "pending_plc",
        MigrationStatus::PendingActivation => "pending_activation",
        MigrationStatus::Completed => "completed",
        MigrationStatus::Failed => "failed",
    }
}

fn migration_type_str(mt: MigrationType) -> &'static str {
    match mt {
        MigrationType::MigrationOut => "migration_out",
        MigrationType::MigrationIn => "migration_in",
    }
}

fn failure_tag_str(tag: FailureTag) -> &'static str {
    match tag {
        FailureTag::Error => "error",
        FailureTag::Cancelled => "cancelled",
    }
}
