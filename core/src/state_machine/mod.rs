use chrono::Utc;

use crate::domain::{FailureTag, Migration, MigrationStatus, MigrationType};
use crate::error::MigrationError;
use crate::vault::SecretVault;

/// Declared (from, to) edges (§4.1). `advance` refuses anything not listed
/// here. `None` as `from` represents the initial post-email-verification
/// transition, which is dispatched on `create_backup_bundle` rather than a
/// single fixed edge.
fn declared_edges(_m: &Migration) -> Vec<(MigrationStatus, MigrationStatus)> {
    use MigrationStatus::*;
    vec![
        (PendingDownload, PendingBackup),
        (PendingBackup, BackupReady),
        (BackupReady, PendingAccount),
        (PendingAccount, PendingRepo),
        (PendingRepo, PendingBlobs),
        (PendingBlobs, PendingPrefs),
        (PendingPrefs, PendingPlc),
        (PendingPlc, PendingActivation),
        (PendingActivation, Completed),
    ]
}

/// Advances `migration` to `target` iff `(current, target)` is a declared
/// edge, or `target == Failed` (any non-terminal may fail). Writes the new
/// status; enqueuing the next phase's job is the caller's (job runtime's)
/// responsibility once this returns `Ok`.
pub fn advance(migration: &mut Migration, target: MigrationStatus) -> Result<(), MigrationError> {
    if migration.status.is_terminal() {
        return Err(MigrationError::Validation(format!(
            "cannot advance a terminal migration (status={:?})",
            migration.status
        )));
    }

    if target == MigrationStatus::Failed {
        return mark_failed(migration, "cancelled or externally failed".to_string());
    }

    let allowed = declared_edges(migration)
        .into_iter()
        .any(|(from, to)| from == migration.status && to == target)
        || is_initial_edge(migration, target);

    if !allowed {
        return Err(MigrationError::Validation(format!(
            "illegal transition {:?} -> {:?}",
            migration.status, target
        )));
    }

    migration.status = target;
    migration.updated_at = Utc::now();

    if target == MigrationStatus::Completed {
        mark_complete(migration);
    }

    Ok(())
}

/// The post-email-verification edge: `pending_download` iff the user
/// requested a backup bundle, else `pending_account` directly (§4.1 edge
/// table, row 1).
fn is_initial_edge(migration: &Migration, target: MigrationStatus) -> bool {
    let is_pre_start = migration.email_verified_at.is_some()
        && migration.progress_data.get_timestamp("account_creation_started_at").is_none()
        && migration.progress_data.get_timestamp("phase_download_started_at").is_none();
    if !is_pre_start {
        return false;
    }
    if migration.create_backup_bundle {
        target == MigrationStatus::PendingDownload
    } else {
        target == MigrationStatus::PendingAccount
    }
}

/// Sets `failed`, increments `retry_count`, records `last_error` (§4.1).
/// Stashes the pre-failure status so the `retry` operator surface (§6.6)
/// can resume from where the job runtime gave up rather than from scratch.
pub fn mark_failed(migration: &mut Migration, error: String) -> Result<(), MigrationError> {
    if migration.status != MigrationStatus::Failed {
        migration
            .progress_data
            .set_string("failed_from_status", format!("{:?}", migration.status));
    }
    migration.status = MigrationStatus::Failed;
    migration.last_error = Some(error);
    migration.retry_count += 1;
    migration.updated_at = Utc::now();
    Ok(())
}

pub fn mark_cancelled(migration: &mut Migration) -> Result<(), MigrationError> {
    if !can_cancel(migration) {
        return Err(MigrationError::Validation(
            "migration is past the cancellable window".to_string(),
        ));
    }
    migration.status = MigrationStatus::Failed;
    migration.failure_tag = Some(FailureTag::Cancelled);
    migration.last_error = Some("cancelled by user".to_string());
    migration.updated_at = Utc::now();
    Ok(())
}

/// Sets `completed`, purges credentials per §3.2 (§4.1 `mark_complete`).
pub fn mark_complete(migration: &mut Migration) {
    migration.status = MigrationStatus::Completed;
    migration.progress_data.set_timestamp("completed_at", Utc::now());
    migration.purge_credentials();
    migration.updated_at = Utc::now();
}

/// §4.1 `can_cancel`: true iff current status is strictly before
/// `pending_plc` and not terminal.
pub fn can_cancel(migration: &Migration) -> bool {
    migration.status.can_cancel()
}

/// Idempotency gate shared by every orchestrator phase (§4.1, §4.6 step 1):
/// a phase job MUST first check the migration's status matches its
/// expected entry status; if not, it logs and returns without side
/// effects.
pub fn expects_status(migration: &Migration, expected: MigrationStatus) -> bool {
    migration.status == expected
}

/// Validates the `migration_in` vs `migration_out` distinction doesn't
/// skip the account-create call incorrectly (§3.1).
pub fn requires_account_creation(migration_type: MigrationType) -> bool {
    matches!(migration_type, MigrationType::MigrationOut)
}

/// Seals rotation metadata and credentials through the vault at record
/// creation; exposed here because the state machine owns the "first save"
/// moment referenced by §3.1's token invariant.
pub fn seal_initial_credentials(
    vault: &SecretVault,
    password: &str,
    invite_code: Option<&str>,
) -> Result<(crate::vault::Encrypted<String>, crate::vault::Encrypted<String>), MigrationError> {
    let sealed_password = vault.seal(&password.to_string(), crate::vault::ttl::source_password())?;
    let sealed_invite = match invite_code {
        Some(code) => vault.seal(&code.to_string(), crate::vault::ttl::invite_code())?,
        None => crate::vault::Encrypted::empty(),
    };
    Ok((sealed_password, sealed_invite))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::migration::ProgressData;
    use crate::vault::Encrypted;
    use chrono::Utc;

    fn fresh_migration(create_backup_bundle: bool) -> Migration {
        Migration {
            id: 1,
            token: "mig_AAAAAAAAAAAAAAAA".to_string(),
            did: "did:plc:abc123".to_string(),
            email: "a@x.test".to_string(),
            old_handle: "u.old.example".to_string(),
            new_handle: "u.new.example".to_string(),
            old_pds_host: "https://old.example".to_string(),
            new_pds_host: "https://new.example".to_string(),
            status: MigrationStatus::PendingAccount,
            migration_type: MigrationType::MigrationOut,
            progress_data: ProgressData::new(),
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
            last_error: None,
            retry_count: 0,
            current_job_step: None,
            current_job_attempt: 0,
            current_job_max_attempts: 3,
            email_verified_at: Some(Utc::now()),
            email_verification_token: None,
            create_backup_bundle,
            failure_tag: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn happy_path_edges_are_allowed_in_order() {
        let mut m = fresh_migration(false);
        m.status = MigrationStatus::PendingAccount;
        assert!(advance(&mut m, MigrationStatus::PendingRepo).is_ok());
        assert!(advance(&mut m, MigrationStatus::PendingBlobs).is_ok());
        assert!(advance(&mut m, MigrationStatus::PendingPrefs).is_ok());
        assert!(advance(&mut m, MigrationStatus::PendingPlc).is_ok());
        assert!(advance(&mut m, MigrationStatus::PendingActivation).is_ok());
        assert!(advance(&mut m, MigrationStatus::Completed).is_ok());
        assert_eq!(m.status, MigrationStatus::Completed);
    }

    #[test]
    fn out_of_order_advance_is_rejected() {
        let mut m = fresh_migration(false);
        m.status = MigrationStatus::PendingAccount;
        assert!(advance(&mut m, MigrationStatus::PendingPlc).is_err());
    }

    #[test]
    fn completion_purges_credentials() {
        let mut m = fresh_migration(false);
        m.status = MigrationStatus::PendingActivation;
        m.old_access_jwt = Encrypted::empty();
        advance(&mut m, MigrationStatus::Completed).unwrap();
        assert!(m.old_password.is_empty());
        assert!(m.new_access_jwt.is_empty());
    }

    #[test]
    fn can_cancel_before_plc_only() {
        let mut m = fresh_migration(false);
        m.status = MigrationStatus::PendingBlobs;
        assert!(can_cancel(&m));
        m.status = MigrationStatus::PendingPlc;
        assert!(!can_cancel(&m));
        m.status = MigrationStatus::PendingActivation;
        assert!(!can_cancel(&m));
    }

    #[test]
    fn idempotency_gate_rejects_mismatched_status() {
        let m = fresh_migration(false);
        assert!(expects_status(&m, MigrationStatus::PendingAccount));
        assert!(!expects_status(&m, MigrationStatus::PendingRepo));
    }
}
