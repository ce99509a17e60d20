use chrono::Utc;
use tracing::instrument;

use crate::domain::MigrationStatus;
use crate::error::{MigrationError, Result};
use crate::repository::MigrationRepository;

use super::super::session;
use super::PhaseContext;

/// Stays in `pending_plc`: asks the source PDS to email the user a one-time
/// directory-operation token (§4.3 `request_plc_token`, §6.2). Idempotent
/// across retried deliveries via its own progress-data marker, since
/// `pending_plc` doesn't change and `expects_status` alone can't tell a
/// fresh entry from a re-delivered job.
#[instrument(skip(ctx), fields(migration_id), err)]
pub async fn run<R: MigrationRepository>(ctx: &PhaseContext<R>, migration_id: i64) -> Result<()> {
    let Some(mut migration) = super::load_expecting(ctx, migration_id, MigrationStatus::PendingPlc).await? else {
        return Ok(());
    };
    if migration.progress_data.get_timestamp("plc_token_requested_at").is_some() {
        return Ok(());
    }

    let source = session::ensure_source_session(&mut migration, &ctx.client, &ctx.vault, ctx.repository.as_ref()).await?;
    ctx.client
        .request_plc_token(&migration.old_pds_host, &source.access_jwt)
        .await
        .map_err(MigrationError::PdsClient)?;

    migration.progress_data.set_timestamp("plc_token_requested_at", Utc::now());
    ctx.repository.update(&migration).await?;
    Ok(())
}
