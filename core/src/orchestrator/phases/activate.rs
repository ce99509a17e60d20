use chrono::Utc;
use tracing::{instrument, warn};

use crate::domain::MigrationStatus;
use crate::error::{MigrationError, Result};
use crate::keygen;
use crate::repository::MigrationRepository;
use crate::state_machine;

use super::super::session;
use super::PhaseContext;

/// `pending_activation -> completed`. Activates the target account,
/// best-effort deactivates the source, and registers a freshly generated
/// rotation key (§4.4, §4.6 "Activate"). `advance` to `Completed` purges
/// every remaining credential except the rotation key (§3.2).
#[instrument(skip(ctx), fields(migration_id), err)]
pub async fn run<R: MigrationRepository>(ctx: &PhaseContext<R>, migration_id: i64) -> Result<()> {
    let Some(mut migration) = super::load_expecting(ctx, migration_id, MigrationStatus::PendingActivation).await? else {
        return Ok(());
    };

    let target = session::ensure_target_session(&mut migration, &ctx.client, &ctx.vault, ctx.repository.as_ref()).await?;
    ctx.client
        .activate_account(&migration.new_pds_host, &target.access_jwt)
        .await
        .map_err(MigrationError::PdsClient)?;
    migration.progress_data.set_timestamp("account_activated_at", Utc::now());

    match session::ensure_source_session(&mut migration, &ctx.client, &ctx.vault, ctx.repository.as_ref()).await {
        Ok(source) => {
            match ctx.client.deactivate_account(&migration.old_pds_host, &source.access_jwt).await {
                Ok(()) => migration.progress_data.set_timestamp("account_deactivated_at", Utc::now()),
                Err(e) => {
                    warn!(migration_id, error = %e, "best-effort source deactivation failed");
                    migration.progress_data.set_string("old_pds_deactivation_error", e.to_string());
                }
            }
        }
        Err(e) => {
            warn!(migration_id, error = %e, "could not establish source session for deactivation, skipping");
            migration.progress_data.set_string("old_pds_deactivation_error", e.to_string());
        }
    }

    let rotation_keypair = keygen::generate()?;
    migration.rotation_private_key = ctx
        .vault
        .seal_durable(&rotation_keypair.private_multibase().to_string())?;
    migration
        .progress_data
        .set_string("rotation_key_public", rotation_keypair.public_did_key());
    migration.progress_data.set_timestamp("rotation_key_generated_at", Utc::now());
    if let Err(e) = ctx
        .client
        .add_rotation_key(&migration.new_pds_host, &target.access_jwt, rotation_keypair.public_did_key())
        .await
    {
        warn!(migration_id, error = %e, "best-effort rotation key registration failed");
        migration.progress_data.set_string("rotation_key_error", e.to_string());
    }

    state_machine::advance(&mut migration, MigrationStatus::Completed)?;
    ctx.repository.update(&migration).await?;
    Ok(())
}
