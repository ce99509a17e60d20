use tracing::instrument;

use crate::domain::MigrationStatus;
use crate::error::{MigrationError, Result};
use crate::repository::MigrationRepository;
use crate::state_machine;

use super::super::{session, workdir};
use super::{enqueue_next, PhaseContext, STEP_IMPORT_BLOBS};

/// `pending_repo -> pending_blobs`: exports the source repository archive
/// and imports it into the target (§4.6 "Import Repo"). Heavy-upload retry
/// budget (7 attempts) is applied by the job runtime's error-kind mapping,
/// not here — this phase is a single attempt per job delivery.
#[instrument(skip(ctx), fields(migration_id), err)]
pub async fn run<R: MigrationRepository>(ctx: &PhaseContext<R>, migration_id: i64) -> Result<()> {
    let Some(mut migration) = super::load_expecting(ctx, migration_id, MigrationStatus::PendingRepo).await? else {
        return Ok(());
    };

    let work_dir = workdir::ensure(std::path::Path::new(&ctx.config.work_root), &migration).await?;
    let source = session::ensure_source_session(&mut migration, &ctx.client, &ctx.vault, ctx.repository.as_ref()).await?;
    let target = session::ensure_target_session(&mut migration, &ctx.client, &ctx.vault, ctx.repository.as_ref()).await?;

    let car_path = work_dir.join("repo.car");
    let bytes = ctx
        .client
        .export_repo(&migration.old_pds_host, &migration.did, &source.access_jwt, &car_path)
        .await
        .map_err(MigrationError::PdsClient)?;
    migration.progress_data.set_timestamp("repo_exported_at", chrono::Utc::now());

    ctx.client
        .import_repo(&migration.new_pds_host, &target.access_jwt, &car_path)
        .await
        .map_err(MigrationError::PdsClient)?;

    migration.progress_data.set_counter("repo_bytes_transferred", bytes);
    migration.progress_data.set_timestamp("repo_imported_at", chrono::Utc::now());

    state_machine::advance(&mut migration, MigrationStatus::PendingBlobs)?;
    ctx.repository.update(&migration).await?;
    enqueue_next(ctx, STEP_IMPORT_BLOBS, migration_id).await;
    Ok(())
}
