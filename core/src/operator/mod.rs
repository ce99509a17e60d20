//! §6.6 operator surface: functions the `server` binary's CLI subcommands
//! call directly against the repository (and, for `check_orphan`, the
//! protocol adapter). These are one-shot maintenance operations, not part
//! of the job runtime — there's no `PhaseContext` here, no job enqueued.

use chrono::Utc;

use crate::domain::{FailureTag, Migration, MigrationStatus};
use crate::error::{MigrationError, Result};
use crate::protocol::{ClientError, PdsClient};
use crate::protocol::types::AccountExistsStatus;
use crate::repository::MigrationRepository;

/// Migrations in `failed` status whose `last_error` contains `pattern`
/// (case-insensitive).
pub async fn list_failed(repository: &impl MigrationRepository, pattern: &str) -> Result<Vec<Migration>> {
    repository.list_failed_matching(pattern).await
}

/// Restores a `failed` migration to the status recorded in
/// `progress_data["failed_from_status"]` (stashed by
/// [`crate::state_machine::mark_failed`]) and persists it. Returns the
/// restored status; the caller (the server binary, or a recovery sweep on
/// the next restart) is responsible for actually re-enqueueing the job,
/// since this module has no queue handle of its own.
pub async fn reset(repository: &impl MigrationRepository, token: &str) -> Result<MigrationStatus> {
    let mut migration = repository.load_by_token(token).await?;
    if migration.status != MigrationStatus::Failed {
        return Err(MigrationError::Validation(format!(
            "migration {token} is not in a failed state"
        )));
    }
    if migration.failure_tag == Some(FailureTag::Cancelled) {
        return Err(MigrationError::Validation(format!(
            "migration {token} was cancelled by its user, not retried"
        )));
    }
    let from_status = migration
        .progress_data
        .get_string("failed_from_status")
        .and_then(|s| MigrationStatus::from_debug_str(&s))
        .ok_or_else(|| {
            MigrationError::Resume("no recoverable status recorded for this migration".to_string())
        })?;

    migration.status = from_status;
    migration.failure_tag = None;
    migration.last_error = None;
    migration.current_job_attempt = 0;
    migration.updated_at = Utc::now();
    repository.update(&migration).await?;
    Ok(from_status)
}

/// Checks whether `did` has an orphaned (deactivated) account record on
/// `target_pds_host` — diagnoses a `create_account` phase that crashed
/// after the target account was created but before the migration record
/// was updated to reflect it.
pub async fn check_orphan(
    client: &PdsClient,
    target_pds_host: &str,
    did: &str,
) -> std::result::Result<AccountExistsStatus, ClientError> {
    client.check_account_exists_on_target(target_pds_host, did).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{migration::ProgressData, MigrationType};
    use crate::repository::memory::InMemoryMigrationRepository;
    use crate::vault::Encrypted;

    fn failed_migration(from_status: MigrationStatus, cancelled: bool) -> Migration {
        let mut progress_data = ProgressData::new();
        progress_data.set_string("failed_from_status", format!("{:?}", from_status));
        Migration {
            id: 0,
            token: "mig_AAAAAAAAAAAAAAAA".to_string(),
            did: "did:plc:abc".to_string(),
            email: "a@x.test".to_string(),
            old_handle: "u.old.example".to_string(),
            new_handle: "u.new.example".to_string(),
            old_pds_host: "https://old.example".to_string(),
            new_pds_host: "https://new.example".to_string(),
            status: MigrationStatus::Failed,
            migration_type: MigrationType::MigrationOut,
            progress_data,
            estimated_memory_mb: 64,
            old_password: Encrypted::empty(),
            old_access_jwt: Encrypted::empty(),
            old_refresh_jwt: Encrypted::empty(),
            new_access_jwt: Encrypted::empty(),
            new_refresh_jwt: Encrypted::empty(),
            directory_one_time_token: Encrypted::empty(),
            invite_code: Encrypted::empty(),
            rotation_private_key: Encrypted::empty(),
            backup_bundle_path: None,
            backup_created_at: None,
            backup_expires_at: None,
            downloaded_data_path: None,
            last_error: Some("network error".to_string()),
            retry_count: 1,
            current_job_step: Some("import_repo".to_string()),
            current_job_attempt: 3,
            current_job_max_attempts: 3,
            email_verified_at: Some(Utc::now()),
            email_verification_token: None,
            create_backup_bundle: false,
            failure_tag: if cancelled { Some(FailureTag::Cancelled) } else { None },
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn reset_restores_pre_failure_status() {
        let repo = InMemoryMigrationRepository::new();
        let m = repo.create(failed_migration(MigrationStatus::PendingRepo, false)).await.unwrap();

        let restored = reset(&repo, &m.token).await.unwrap();
        assert_eq!(restored, MigrationStatus::PendingRepo);

        let reloaded = repo.load(m.id).await.unwrap();
        assert_eq!(reloaded.status, MigrationStatus::PendingRepo);
        assert!(reloaded.last_error.is_none());
        assert_eq!(reloaded.current_job_attempt, 0);
    }

    #[tokio::test]
    async fn reset_refuses_cancelled_migration() {
        let repo = InMemoryMigrationRepository::new();
        let m = repo.create(failed_migration(MigrationStatus::PendingRepo, true)).await.unwrap();

        assert!(reset(&repo, &m.token).await.is_err());
    }
}
