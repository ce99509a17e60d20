use tracing::instrument;

use crate::domain::MigrationStatus;
use crate::error::{MigrationError, Result};
use crate::repository::MigrationRepository;
use crate::state_machine;

use super::super::session;
use super::{enqueue_next, PhaseContext, STEP_REQUEST_PLC_TOKEN};

/// `pending_prefs -> pending_plc`: copies `app.bsky.actor.getPreferences`
/// verbatim onto the target (§4.6 "Import Preferences").
#[instrument(skip(ctx), fields(migration_id), err)]
pub async fn run<R: MigrationRepository>(ctx: &PhaseContext<R>, migration_id: i64) -> Result<()> {
    let Some(mut migration) = super::load_expecting(ctx, migration_id, MigrationStatus::PendingPrefs).await? else {
        return Ok(());
    };

    let source = session::ensure_source_session(&mut migration, &ctx.client, &ctx.vault, ctx.repository.as_ref()).await?;
    let target = session::ensure_target_session(&mut migration, &ctx.client, &ctx.vault, ctx.repository.as_ref()).await?;

    let preferences = ctx
        .client
        .export_preferences(&migration.old_pds_host, &source.access_jwt)
        .await
        .map_err(MigrationError::PdsClient)?;
    migration.progress_data.set_timestamp("preferences_exported_at", chrono::Utc::now());
    ctx.client
        .import_preferences(&migration.new_pds_host, &target.access_jwt, &preferences)
        .await
        .map_err(MigrationError::PdsClient)?;

    migration.progress_data.set_timestamp("preferences_imported_at", chrono::Utc::now());

    state_machine::advance(&mut migration, MigrationStatus::PendingPlc)?;
    ctx.repository.update(&migration).await?;
    enqueue_next(ctx, STEP_REQUEST_PLC_TOKEN, migration_id).await;
    Ok(())
}
