use async_trait::async_trait;
use chrono::Utc;
use tracing::instrument;

use crate::blob_transfer::progress::{BlobProgressSnapshot, ProgressSink};
use crate::blob_transfer::ConcurrentBlobMigration;
use crate::domain::MigrationStatus;
use crate::error::{MigrationError, Result};
use crate::repository::MigrationRepository;

use super::super::{session, workdir};
use super::{enqueue_next, PhaseContext, STEP_BUILD_BACKUP};

/// Mirrors `import_blobs`'s snapshot sink (§4.5) for the download-only
/// backup phase, under its own progress-data keys.
struct RepositorySnapshotSink<'a, R: MigrationRepository> {
    repository: &'a R,
    migration_id: i64,
}

#[async_trait]
impl<'a, R: MigrationRepository> ProgressSink for RepositorySnapshotSink<'a, R> {
    async fn on_progress(&self, snapshot: &BlobProgressSnapshot) {
        let Ok(mut migration) = self.repository.load(self.migration_id).await else {
            return;
        };
        migration.progress_data.set_counter("backup_blob_count", snapshot.completed_blobs as u64);
        migration.progress_data.set_failed_blobs("backup_missing_blobs", &snapshot.failed_blobs);
        let _ = self.repository.update(&migration).await;
    }
}

/// `pending_download -> pending_backup`: only entered when
/// `create_backup_bundle` is set. Exports a fresh repo snapshot and
/// downloads every blob into the migration's work directory so
/// [`super::build_backup`] can zip them (§4.6 "Download", §6.3).
#[instrument(skip(ctx), fields(migration_id), err)]
pub async fn run<R: MigrationRepository>(ctx: &PhaseContext<R>, migration_id: i64) -> Result<()> {
    let Some(mut migration) = super::load_expecting(ctx, migration_id, MigrationStatus::PendingDownload).await? else {
        return Ok(());
    };

    migration.progress_data.set_timestamp("phase_download_started_at", Utc::now());

    let work_dir = workdir::ensure(std::path::Path::new(&ctx.config.work_root), &migration).await?;
    let source = session::ensure_source_session(&mut migration, &ctx.client, &ctx.vault, ctx.repository.as_ref()).await?;

    ctx.client
        .export_repo(&migration.old_pds_host, &migration.did, &source.access_jwt, &work_dir.join("repo.car"))
        .await
        .map_err(MigrationError::PdsClient)?;

    let snapshot_sink = RepositorySnapshotSink {
        repository: ctx.repository.as_ref(),
        migration_id,
    };
    let engine = ConcurrentBlobMigration {
        client: &ctx.client,
        source_pds: &migration.old_pds_host,
        target_pds: "",
        did: &migration.did,
        target_access_jwt: "",
        work_dir: &work_dir,
        pool_size: crate::blob_transfer::concurrent::DEFAULT_POOL_SIZE,
        progress_sink: Some(&snapshot_sink),
    };
    let download = engine.download_all().await.map_err(MigrationError::PdsClient)?;

    migration.downloaded_data_path = Some(work_dir.display().to_string());
    migration.progress_data.set_counter("backup_blob_count", download.downloaded.len() as u64);
    migration.progress_data.set_failed_blobs("backup_missing_blobs", &download.missing_blobs);
    migration.progress_data.set_timestamp("phase_download_completed_at", Utc::now());

    crate::state_machine::advance(&mut migration, MigrationStatus::PendingBackup)?;
    ctx.repository.update(&migration).await?;
    enqueue_next(ctx, STEP_BUILD_BACKUP, migration_id).await;
    Ok(())
}
