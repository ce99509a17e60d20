use chrono::Utc;
use tracing::{instrument, warn};

use crate::domain::MigrationStatus;
use crate::error::{MigrationError, Result};
use crate::repository::MigrationRepository;
use crate::state_machine;

use super::super::session;
use super::{enqueue_next, PhaseContext, STEP_ACTIVATE};

/// `pending_plc -> pending_activation`. **The point of no return**: once
/// `submitPlcOperation` succeeds, the DID document now points at the
/// target PDS (§4.6, glossary). Runs on the `critical` queue with the
/// tightest retry ceiling (§4.2).
#[instrument(skip(ctx), fields(migration_id), err)]
pub async fn run<R: MigrationRepository>(ctx: &PhaseContext<R>, migration_id: i64) -> Result<()> {
    let Some(mut migration) = super::load_expecting(ctx, migration_id, MigrationStatus::PendingPlc).await? else {
        return Ok(());
    };
    let now = Utc::now();

    let one_time_token = ctx.vault.open(&migration.directory_one_time_token, now).ok_or_else(|| {
        MigrationError::Authentication("directory one-time token missing or expired".to_string())
    })?;

    let source = session::ensure_source_session(&mut migration, &ctx.client, &ctx.vault, ctx.repository.as_ref()).await?;
    let target = session::ensure_target_session(&mut migration, &ctx.client, &ctx.vault, ctx.repository.as_ref()).await?;

    let recommended = ctx
        .client
        .get_recommended_directory_op(&migration.new_pds_host, &target.access_jwt)
        .await
        .map_err(MigrationError::PdsClient)?;
    migration.progress_data.set_timestamp("plc_operation_recommended_at", Utc::now());

    let signed = ctx
        .client
        .sign_directory_op(&migration.old_pds_host, &source.access_jwt, &recommended.unsigned_op, &one_time_token)
        .await
        .map_err(MigrationError::PdsClient)?;
    migration.progress_data.set_timestamp("plc_operation_signed_at", Utc::now());

    if let Err(e) = ctx
        .client
        .submit_directory_op(&migration.new_pds_host, &target.access_jwt, &signed.signed_op)
        .await
    {
        warn!(migration_id, error = %e, "directory submission failed, admin attention required");
        return Err(MigrationError::PdsClient(e));
    }

    migration.purge_directory_token();
    migration.progress_data.set_timestamp("plc_operation_submitted_at", now);

    state_machine::advance(&mut migration, MigrationStatus::PendingActivation)?;
    ctx.repository.update(&migration).await?;
    enqueue_next(ctx, STEP_ACTIVATE, migration_id).await;
    Ok(())
}
