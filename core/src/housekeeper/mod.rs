use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tracing::{info, warn};

use crate::domain::Migration;
use crate::repository::MigrationRepository;

/// Periodic cleanup of expired backup bundles, stale per-migration work
/// directories, and a defensive re-sweep of terminal migrations' credential
/// fields (§2 component 9, §6.3 retention).
const SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(300);

/// Work directories belonging to a terminal migration older than this are
/// considered stale and removed; not specified by name in the source, so
/// this mirrors the longest credential TTL (48h, §3.2) as the conservative
/// floor (see DESIGN.md Open Questions).
const STALE_WORK_DIR_AGE: Duration = Duration::hours(48);

pub struct Housekeeper<R: MigrationRepository> {
    repository: Arc<R>,
    work_root: PathBuf,
}

impl<R: MigrationRepository + 'static> Housekeeper<R> {
    pub fn new(repository: Arc<R>, work_root: impl Into<PathBuf>) -> Self {
        Self {
            repository,
            work_root: work_root.into(),
        }
    }

    /// Runs one sweep immediately, then forever on `SWEEP_INTERVAL`. Call
    /// this from a `tokio::spawn` during server startup.
    pub async fn run(self) {
        info!(interval_secs = SWEEP_INTERVAL.as_secs(), "housekeeper started");
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = self.sweep_once().await {
                warn!(error = %e, "housekeeper sweep failed");
            }
        }
    }

    pub async fn sweep_once(&self) -> crate::error::Result<()> {
        let expired_backups = self.purge_expired_backups().await?;
        let purged_credentials = self.purge_stale_terminal_credentials().await?;
        let removed_dirs = self.purge_stale_work_dirs().await;

        if expired_backups + purged_credentials + removed_dirs > 0 {
            info!(
                expired_backups,
                purged_credentials, removed_dirs, "housekeeper sweep complete"
            );
        }
        Ok(())
    }

    async fn purge_expired_backups(&self) -> crate::error::Result<usize> {
        let now = Utc::now();
        let expired = self.repository.list_expired_backups(now).await?;
        let mut count = 0;
        for mut migration in expired {
            if let Some(path) = migration.backup_bundle_path.take() {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(path, error = %e, "failed to delete expired backup bundle");
                        continue;
                    }
                }
            }
            migration.backup_created_at = None;
            migration.backup_expires_at = None;
            migration.updated_at = now;
            self.repository.update(&migration).await?;
            count += 1;
        }
        Ok(count)
    }

    /// Terminal migrations already have their credentials purged by
    /// `state_machine::mark_complete`/`mark_failed` on the happy path; this
    /// is a defensive second pass for anything that slipped through (e.g. a
    /// process crash between status write and credential purge).
    async fn purge_stale_terminal_credentials(&self) -> crate::error::Result<usize> {
        let cutoff = Utc::now() - Duration::hours(1);
        let stale = self.repository.list_terminal_older_than(cutoff).await?;
        let mut count = 0;
        for mut migration in stale {
            if has_any_credential(&migration) {
                migration.purge_credentials();
                migration.updated_at = Utc::now();
                self.repository.update(&migration).await?;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn purge_stale_work_dirs(&self) -> usize {
        let cutoff = match std::time::SystemTime::now().checked_sub(
            StdDuration::from_secs(STALE_WORK_DIR_AGE.num_seconds().max(0) as u64),
        ) {
            Some(t) => t,
            None => return 0,
        };

        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(&self.work_root).await {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if dir_is_stale(&path, cutoff).await && tokio::fs::remove_dir_all(&path).await.is_ok() {
                removed += 1;
            }
        }
        removed
    }
}

async fn dir_is_stale(path: &Path, cutoff: std::time::SystemTime) -> bool {
    match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
        Ok(modified) => modified < cutoff,
        Err(_) => false,
    }
}

fn has_any_credential(migration: &Migration) -> bool {
    !migration.old_password.is_empty()
        || !migration.old_access_jwt.is_empty()
        || !migration.old_refresh_jwt.is_empty()
        || !migration.new_access_jwt.is_empty()
        || !migration.new_refresh_jwt.is_empty()
        || !migration.directory_one_time_token.is_empty()
        || !migration.invite_code.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MigrationStatus, MigrationType, ProgressData};
    use crate::repository::memory::InMemoryMigrationRepository;
    use crate::vault::Encrypted;

    fn terminal_migration(backup_expires_at: Option<chrono::DateTime<Utc>>) -> Migration {
        Migration {
            id: 0,
            token: "mig_AAAAAAAAAAAAAAAA".to_string(),
            did: "did:plc:abc".to_string(),
            email: "a@x.test".to_string(),
            old_handle: "u.old.example".to_string(),
            new_handle: "u.new.example".to_string(),
            old_pds_host: "https://old.example".to_string(),
            new_pds_host: "https://new.example".to_string(),
            status: MigrationStatus::Completed,
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
            backup_bundle_path: backup_expires_at.map(|_| "/tmp/does-not-exist.zip".to_string()),
            backup_created_at: backup_expires_at.map(|e| e - Duration::hours(24)),
            backup_expires_at,
            downloaded_data_path: None,
            last_error: None,
            retry_count: 0,
            current_job_step: None,
            current_job_attempt: 0,
            current_job_max_attempts: 3,
            email_verified_at: Some(Utc::now()),
            email_verification_token: None,
            create_backup_bundle: true,
            failure_tag: None,
            created_at: Utc::now() - Duration::hours(2),
            updated_at: Utc::now() - Duration::hours(2),
        }
    }

    #[tokio::test]
    async fn expired_backup_is_purged_from_record() {
        let repo = Arc::new(InMemoryMigrationRepository::new());
        let m = repo
            .create(terminal_migration(Some(Utc::now() - Duration::hours(1))))
            .await
            .unwrap();

        let housekeeper = Housekeeper::new(repo.clone(), std::env::temp_dir());
        housekeeper.sweep_once().await.unwrap();

        let reloaded = repo.load(m.id).await.unwrap();
        assert!(reloaded.backup_bundle_path.is_none());
        assert!(reloaded.backup_expires_at.is_none());
    }

    #[tokio::test]
    async fn unexpired_backup_is_untouched() {
        let repo = Arc::new(InMemoryMigrationRepository::new());
        let m = repo
            .create(terminal_migration(Some(Utc::now() + Duration::hours(1))))
            .await
            .unwrap();

        let housekeeper = Housekeeper::new(repo.clone(), std::env::temp_dir());
        housekeeper.sweep_once().await.unwrap();

        let reloaded = repo.load(m.id).await.unwrap();
        assert!(reloaded.backup_bundle_path.is_some());
    }
}
