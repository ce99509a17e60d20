use chrono::Utc;
use tracing::{info, instrument};

use crate::domain::{MigrationStatus, MigrationType};
use crate::error::{MigrationError, Result};
use crate::repository::MigrationRepository;
use crate::state_machine;

use super::super::session;
use super::{enqueue_next, PhaseContext, STEP_IMPORT_REPO};

/// `pending_account -> pending_repo`. `migration_out` mints a service-auth
/// token from the source session and calls `createAccount` on the target
/// with the same DID; `migration_in` only confirms the target account is
/// reachable (§4.6 "Create Account").
#[instrument(skip(ctx), fields(migration_id), err)]
pub async fn run<R: MigrationRepository>(ctx: &PhaseContext<R>, migration_id: i64) -> Result<()> {
    let Some(mut migration) = super::load_expecting(ctx, migration_id, MigrationStatus::PendingAccount).await? else {
        return Ok(());
    };
    migration.progress_data.set_timestamp("account_creation_started_at", Utc::now());

    if state_machine::requires_account_creation(migration.migration_type) {
        create_on_target(ctx, &mut migration).await?;
    } else {
        session::ensure_target_session(&mut migration, &ctx.client, &ctx.vault, ctx.repository.as_ref()).await?;
        info!(did = %migration.did, "migration_in: target account already exists, session confirmed");
    }

    state_machine::advance(&mut migration, MigrationStatus::PendingRepo)?;
    ctx.repository.update(&migration).await?;
    enqueue_next(ctx, STEP_IMPORT_REPO, migration_id).await;
    Ok(())
}

async fn create_on_target<R: MigrationRepository>(
    ctx: &PhaseContext<R>,
    migration: &mut crate::domain::Migration,
) -> Result<()> {
    debug_assert_eq!(migration.migration_type, MigrationType::MigrationOut);
    let now = Utc::now();

    let source = session::ensure_source_session(migration, &ctx.client, &ctx.vault, ctx.repository.as_ref()).await?;

    let target_description = ctx
        .client
        .describe_server(&migration.new_pds_host)
        .await
        .map_err(MigrationError::PdsClient)?;
    let target_service_did = target_description["did"].as_str().ok_or_else(|| {
        MigrationError::Validation("target describeServer response missing did".to_string())
    })?;

    let service_auth_token = ctx
        .client
        .get_service_auth(&migration.old_pds_host, &source.access_jwt, target_service_did)
        .await
        .map_err(MigrationError::PdsClient)?;

    let password = ctx.vault.open(&migration.old_password, now).ok_or_else(|| {
        MigrationError::Authentication("source password expired before account creation".to_string())
    })?;
    let invite_code = ctx.vault.open(&migration.invite_code, now);

    let result = ctx
        .client
        .create_account_on_target(
            &migration.new_pds_host,
            &migration.did,
            &migration.new_handle,
            &migration.email,
            &password,
            invite_code.as_deref(),
            &service_auth_token,
        )
        .await
        .map_err(MigrationError::PdsClient)?;

    if result.success {
        if let Some(new_session) = &result.session {
            session::install_target_session(migration, &ctx.vault, &new_session.access_jwt, &new_session.refresh_jwt)?;
        }
        migration.progress_data.set_timestamp("account_created_at", Utc::now());
        return Ok(());
    }

    let status = ctx
        .client
        .check_account_exists_on_target(&migration.new_pds_host, &migration.did)
        .await
        .map_err(MigrationError::PdsClient)?;

    // §4.6/§7: AccountExists is always a discard, never a retry and never a
    // silent success — only the operator-facing message distinguishes
    // orphaned-deactivated (cleanup required) from an active account
    // (migration impossible outright).
    if status.exists && status.deactivated {
        return Err(MigrationError::AccountExists(format!(
            "Orphaned deactivated account already exists on target for {}; operator cleanup required before retrying",
            migration.did
        )));
    }

    Err(MigrationError::AccountExists(format!(
        "target already has an active account for {}",
        migration.did
    )))
}
