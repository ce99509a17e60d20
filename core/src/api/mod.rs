//! Form-facing surface (§6.1): the one place outside the job runtime that
//! mutates a [`Migration`](crate::domain::Migration). Every operation takes
//! explicit typed arguments and returns an explicit typed result — no
//! generic params map, no implicit field assignment (§9).

pub mod requests;

use std::sync::Arc;

use chrono::Utc;
use tracing::instrument;

use crate::config::{Config, InviteCodeMode};
use crate::domain::migration::ProgressData;
use crate::domain::{validation, Migration, MigrationStatus};
use crate::error::{MigrationError, Result};
use crate::jobs::queue::{JobQueue, QueuePriority};
use crate::operator;
use crate::orchestrator::phases;
use crate::repository::MigrationRepository;
use crate::state_machine;
use crate::vault::{ttl, Encrypted, SecretVault};

pub use requests::{CreateMigrationRequest, MigrationStatusView};

/// Placeholder pre-verification status: the fields that actually gate the
/// first real `advance` (§4.1 edge table, row 1) are `email_verified_at`
/// and the progress-data start markers, not this value, so any status is
/// sound here. `PendingDownload` is least surprising to read in storage.
const PRE_VERIFICATION_STATUS: MigrationStatus = MigrationStatus::PendingDownload;

pub struct FormHandlerApi<R: MigrationRepository> {
    repository: Arc<R>,
    vault: Arc<SecretVault>,
    queue: Arc<JobQueue>,
    config: Arc<Config>,
}

impl<R: MigrationRepository> FormHandlerApi<R> {
    pub fn new(repository: Arc<R>, vault: Arc<SecretVault>, queue: Arc<JobQueue>, config: Arc<Config>) -> Self {
        Self {
            repository,
            vault,
            queue,
            config,
        }
    }

    /// §6.1 `create_migration`. Validates every user-supplied field, seals
    /// the source password (and invite code, if present) into the vault,
    /// and persists the record in its pre-verification state. Does not
    /// enqueue any job: the first phase only runs once `verify_email`
    /// confirms the address (§4.1).
    #[instrument(skip(self, req), fields(did = %req.did), err)]
    pub async fn create_migration(&self, req: CreateMigrationRequest) -> Result<Migration> {
        validation::validate_did(&req.did)?;
        validation::validate_handle(&req.old_handle)?;
        validation::validate_handle(&req.new_handle)?;
        validation::validate_email(&req.email)?;
        let old_pds_host = validation::normalize_and_guard_host(&req.old_pds_host)?;
        let new_pds_host = validation::normalize_and_guard_host(&req.new_pds_host)?;

        if self.config.invite_code_mode == InviteCodeMode::Required && req.invite_code.is_none() {
            return Err(MigrationError::Validation(
                "an invite code is required on this deployment".to_string(),
            ));
        }

        if self.repository.find_non_terminal_by_did(&req.did).await?.is_some() {
            return Err(MigrationError::Validation(format!(
                "a migration for {} is already in progress",
                req.did
            )));
        }

        let (sealed_password, sealed_invite) =
            state_machine::seal_initial_credentials(&self.vault, &req.old_password, req.invite_code.as_deref())?;

        let now = Utc::now();
        let migration = Migration {
            id: 0,
            token: validation::generate_migration_token(),
            did: req.did,
            email: req.email,
            old_handle: req.old_handle,
            new_handle: req.new_handle,
            old_pds_host,
            new_pds_host,
            status: PRE_VERIFICATION_STATUS,
            migration_type: req.migration_type,
            progress_data: ProgressData::new(),
            estimated_memory_mb: 64,
            old_password: sealed_password,
            old_access_jwt: Encrypted::empty(),
            old_refresh_jwt: Encrypted::empty(),
            new_access_jwt: Encrypted::empty(),
            new_refresh_jwt: Encrypted::empty(),
            directory_one_time_token: Encrypted::empty(),
            invite_code: sealed_invite,
            rotation_private_key: Encrypted::empty(),
            backup_bundle_path: None,
            backup_created_at: None,
            backup_expires_at: None,
            downloaded_data_path: None,
            last_error: None,
            retry_count: 0,
            current_job_step: None,
            current_job_attempt: 0,
            current_job_max_attempts: 3,
            email_verified_at: None,
            email_verification_token: Some(validation::generate_migration_token()),
            create_backup_bundle: req.create_backup_bundle,
            failure_tag: None,
            created_at: now,
            updated_at: now,
        };

        self.repository.create(migration).await
    }

    /// §6.1 `verify_email`. Confirms the mailed token, records
    /// `email_verified_at`, and fires the first phase job: `download_backup`
    /// if the user opted into a backup bundle, `create_account` otherwise
    /// (§4.1 edge table, row 1).
    #[instrument(skip(self, submitted_code), err)]
    pub async fn verify_email(&self, token: &str, submitted_code: &str) -> Result<Migration> {
        let mut migration = self.repository.load_by_token(token).await?;
        if migration.email_verified_at.is_some() {
            return Err(MigrationError::Validation("email already verified".to_string()));
        }
        let matches = migration
            .email_verification_token
            .as_deref()
            .map(|expected| expected == submitted_code)
            .unwrap_or(false);
        if !matches {
            return Err(MigrationError::Validation(
                "verification code does not match".to_string(),
            ));
        }

        migration.email_verified_at = Some(Utc::now());
        migration.email_verification_token = None;

        let (target_status, step) = if migration.create_backup_bundle {
            (MigrationStatus::PendingDownload, phases::STEP_DOWNLOAD_BACKUP)
        } else {
            (MigrationStatus::PendingAccount, phases::STEP_CREATE_ACCOUNT)
        };
        state_machine::advance(&mut migration, target_status)?;
        self.repository.update(&migration).await?;
        self.queue.enqueue(migration.id, step, QueuePriority::Migrations).await;
        Ok(migration)
    }

    /// §6.1 `get_status`. Returns the public-safe projection only.
    #[instrument(skip(self), err)]
    pub async fn get_status(&self, token: &str) -> Result<MigrationStatusView> {
        let migration = self.repository.load_by_token(token).await?;
        Ok(MigrationStatusView::from(&migration))
    }

    /// §6.1 `submit_directory_token`. Seals the one-time token the user
    /// copied out of their source-PDS email and schedules the irreversible
    /// `submit_directory_op` phase on the `critical` queue.
    #[instrument(skip(self, one_time_token), err)]
    pub async fn submit_directory_token(&self, token: &str, one_time_token: &str) -> Result<()> {
        let mut migration = self.repository.load_by_token(token).await?;
        if migration.status != MigrationStatus::PendingPlc {
            return Err(MigrationError::Validation(
                "migration is not awaiting a directory token".to_string(),
            ));
        }
        migration.directory_one_time_token = self
            .vault
            .seal(&one_time_token.to_string(), ttl::directory_one_time_token())?;
        self.repository.update(&migration).await?;
        self.queue
            .enqueue(migration.id, phases::STEP_DIRECTORY_UPDATE, QueuePriority::Critical)
            .await;
        Ok(())
    }

    /// §6.1 `download_backup`. Returns the bundle's filesystem path iff one
    /// exists and its 24h retention window hasn't elapsed (§6.3).
    #[instrument(skip(self), err)]
    pub async fn download_backup(&self, token: &str) -> Result<String> {
        let migration = self.repository.load_by_token(token).await?;
        let path = migration.backup_bundle_path.clone().ok_or_else(|| {
            MigrationError::Validation("no backup bundle has been built for this migration".to_string())
        })?;
        if let Some(expires_at) = migration.backup_expires_at {
            if Utc::now() >= expires_at {
                return Err(MigrationError::Validation("backup bundle has expired".to_string()));
            }
        }
        Ok(path)
    }

    /// §6.1 `cancel`. Delegates the cancellable-window check to
    /// [`state_machine::mark_cancelled`].
    #[instrument(skip(self), err)]
    pub async fn cancel(&self, token: &str) -> Result<()> {
        let mut migration = self.repository.load_by_token(token).await?;
        state_machine::mark_cancelled(&mut migration)?;
        self.repository.update(&migration).await?;
        Ok(())
    }

    /// §6.6 operator surface: restores a `failed` migration to the status
    /// it was in before `mark_failed` ran and re-enqueues the job that
    /// would have resumed it from there. Refuses migrations that were
    /// cancelled by the user (that `failed` is intentional, not an error
    /// to retry) and ones with no recoverable status on record (migrations
    /// created before this marker existed, or corrupted progress data).
    /// Shares its status-restore logic with [`operator::reset`] (the CLI's
    /// equivalent for operators without a running server's queue handle);
    /// this form-facing version additionally re-enqueues the resume step
    /// immediately, since it runs inside the serving process.
    #[instrument(skip(self), err)]
    pub async fn retry(&self, token: &str) -> Result<()> {
        let from_status = operator::reset(self.repository.as_ref(), token).await?;
        let migration = self.repository.load_by_token(token).await?;

        let step = phases::entry_step_for_status(from_status);
        self.queue.enqueue(migration.id, step, phases::priority_for_step(step)).await;
        Ok(())
    }
}
