use async_trait::async_trait;
use tracing::{info, instrument};

use crate::blob_transfer::progress::{BlobProgressSnapshot, ProgressSink};
use crate::blob_transfer::{ConcurrentBlobMigration, StreamedBlobMigration};
use crate::domain::MigrationStatus;
use crate::error::{MigrationError, Result};
use crate::jobs::admission;
use crate::repository::MigrationRepository;
use crate::state_machine;

use super::super::{session, workdir};
use super::{enqueue_next, PhaseContext, STEP_IMPORT_PREFS};

/// Persists a `BlobProgressSnapshot` onto the migration record mid-phase
/// (§4.5), re-loading by id so concurrent writers (download/upload pool
/// workers) never clobber each other's `progress_data` with a stale copy.
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
        migration.progress_data.set_counter("blobs_completed", snapshot.completed_blobs as u64);
        migration.progress_data.set_counter("bytes_transferred", snapshot.completed_bytes);
        migration.progress_data.set_failed_blobs("failed_blobs", &snapshot.failed_blobs);
        let _ = self.repository.update(&migration).await;
    }
}

/// `pending_blobs -> pending_prefs`, gated by the global blob-phase
/// admission cap (§4.2). Dispatches to the streamed or concurrent engine
/// depending on `create_backup_bundle` (§4.5).
#[instrument(skip(ctx), fields(migration_id), err)]
pub async fn run<R: MigrationRepository>(ctx: &PhaseContext<R>, migration_id: i64) -> Result<()> {
    let Some(mut migration) = super::load_expecting(ctx, migration_id, MigrationStatus::PendingBlobs).await? else {
        return Ok(());
    };

    let in_flight = ctx
        .repository
        .count_in_status(MigrationStatus::PendingBlobs)
        .await?
        .saturating_sub(1);
    if !admission::admit(in_flight, ctx.config.max_concurrent_migrations) {
        info!(migration_id, in_flight, "blob phase admission denied, requeuing");
        admission::requeue_for_admission(&ctx.queue, migration_id).await;
        return Ok(());
    }

    let work_dir = workdir::ensure(std::path::Path::new(&ctx.config.work_root), &migration).await?;
    session::ensure_source_session(&mut migration, &ctx.client, &ctx.vault, ctx.repository.as_ref()).await?;
    let target = session::ensure_target_session(&mut migration, &ctx.client, &ctx.vault, ctx.repository.as_ref()).await?;
    migration.progress_data.set_timestamp("blobs_started_at", chrono::Utc::now());

    let blob_count;
    let mut failed_blobs = Vec::new();
    let mut completed: u32 = 0;
    let mut bytes_transferred: u64 = 0;

    let snapshot_sink = RepositorySnapshotSink {
        repository: ctx.repository.as_ref(),
        migration_id,
    };

    if migration.create_backup_bundle {
        let engine = ConcurrentBlobMigration {
            client: &ctx.client,
            source_pds: &migration.old_pds_host,
            target_pds: &migration.new_pds_host,
            did: &migration.did,
            target_access_jwt: &target.access_jwt,
            work_dir: &work_dir,
            pool_size: crate::blob_transfer::concurrent::DEFAULT_POOL_SIZE,
            progress_sink: Some(&snapshot_sink),
        };
        let download = engine.download_all().await.map_err(MigrationError::PdsClient)?;
        blob_count = download.downloaded.len() + download.missing_blobs.len();
        let upload = engine.upload_all(&download.downloaded).await.map_err(MigrationError::PdsClient)?;
        migration
            .progress_data
            .set_failed_blobs("failed_downloads", &download.missing_blobs);
        migration
            .progress_data
            .set_failed_blobs("failed_uploads", &upload.failed_blobs);
        failed_blobs.extend(download.missing_blobs);
        failed_blobs.extend(upload.failed_blobs);
        completed = upload.uploaded;
        bytes_transferred = upload.bytes_transferred;
        migration.progress_data.set_counter("blobs_uploaded", completed as u64);
    } else {
        let engine = StreamedBlobMigration {
            client: &ctx.client,
            source_pds: &migration.old_pds_host,
            target_pds: &migration.new_pds_host,
            did: &migration.did,
            target_access_jwt: &target.access_jwt,
            work_dir: &work_dir,
            progress_sink: Some(&snapshot_sink),
        };
        let result = engine.run().await.map_err(MigrationError::PdsClient)?;
        blob_count = result.blob_count;
        failed_blobs = result.failed_blobs;
        completed = result.completed_blobs;
        bytes_transferred = result.bytes_transferred;
    }

    migration.progress_data.set_counter("blob_count", blob_count as u64);
    migration.progress_data.set_counter("blobs_completed", completed as u64);
    migration.progress_data.set_counter("bytes_transferred", bytes_transferred);
    migration.progress_data.set_failed_blobs("failed_blobs", &failed_blobs);
    migration.progress_data.set_timestamp("blobs_completed_at", chrono::Utc::now());

    state_machine::advance(&mut migration, MigrationStatus::PendingPrefs)?;
    ctx.repository.update(&migration).await?;
    enqueue_next(ctx, STEP_IMPORT_PREFS, migration_id).await;
    Ok(())
}
