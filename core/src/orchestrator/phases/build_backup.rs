use std::path::PathBuf;

use tracing::instrument;

use crate::backup;
use crate::domain::MigrationStatus;
use crate::error::{MigrationError, Result, StorageError};
use crate::repository::MigrationRepository;
use crate::state_machine;

use super::{enqueue_next, PhaseContext, STEP_CREATE_ACCOUNT};

/// `pending_backup -> backup_ready -> pending_account`: zips the work
/// directory's `repo.car` and downloaded blobs into the user-facing backup
/// archive, then advances automatically into account creation (§4.1 edge
/// table row 3 is unconditional, no job waits in `backup_ready`).
#[instrument(skip(ctx), fields(migration_id), err)]
pub async fn run<R: MigrationRepository>(ctx: &PhaseContext<R>, migration_id: i64) -> Result<()> {
    let Some(mut migration) = super::load_expecting(ctx, migration_id, MigrationStatus::PendingBackup).await? else {
        return Ok(());
    };

    let work_dir = PathBuf::from(migration.downloaded_data_path.clone().ok_or_else(|| {
        MigrationError::Storage {
            source: StorageError::NotFound("downloaded_data_path".to_string()),
            context: "build_backup phase".to_string(),
        }
    })?);
    let repo_car_path = work_dir.join("repo.car");

    let mut downloaded_blobs = Vec::new();
    let mut entries = tokio::fs::read_dir(&work_dir).await.map_err(|e| MigrationError::Storage {
        source: StorageError::Backend(format!("failed to read work dir: {e}")),
        context: "build_backup phase".to_string(),
    })?;
    while let Some(entry) = entries.next_entry().await.map_err(|e| MigrationError::Storage {
        source: StorageError::Backend(format!("failed to read work dir entry: {e}")),
        context: "build_backup phase".to_string(),
    })? {
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(cid) = name.strip_prefix("blob-") {
            downloaded_blobs.push((cid.to_string(), entry.path()));
        }
    }
    let missing_blobs = migration.progress_data.get_failed_blobs("backup_missing_blobs");

    let (bundle_path, created_at) =
        backup::build_bundle(&migration, &repo_car_path, &downloaded_blobs, &missing_blobs, &work_dir).await?;

    migration.backup_bundle_path = Some(bundle_path.display().to_string());
    migration.backup_created_at = Some(created_at);
    migration.backup_expires_at = Some(backup::expiry_from(created_at));

    state_machine::advance(&mut migration, MigrationStatus::BackupReady)?;
    state_machine::advance(&mut migration, MigrationStatus::PendingAccount)?;
    ctx.repository.update(&migration).await?;
    enqueue_next(ctx, STEP_CREATE_ACCOUNT, migration_id).await;
    Ok(())
}
