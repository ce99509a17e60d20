pub mod activate;
pub mod build_backup;
pub mod create_account;
pub mod directory_update;
pub mod download_backup;
pub mod import_blobs;
pub mod import_preferences;
pub mod import_repo;
pub mod request_plc_token;

use tracing::debug;

use crate::domain::{Migration, MigrationStatus};
use crate::error::{MigrationError, Result};
use crate::jobs::queue::QueuePriority;
use crate::repository::MigrationRepository;
use crate::state_machine;

use super::context::PhaseContext;

/// Step names used both as job-queue payload (`Job::step`) and as
/// `current_job_step` (§3.1, retried by the `retry` operator surface, §6.6).
pub const STEP_DOWNLOAD_BACKUP: &str = "download_backup";
pub const STEP_BUILD_BACKUP: &str = "build_backup";
pub const STEP_CREATE_ACCOUNT: &str = "create_account";
pub const STEP_IMPORT_REPO: &str = "import_repo";
pub const STEP_IMPORT_BLOBS: &str = "import_blobs";
pub const STEP_IMPORT_PREFS: &str = "import_preferences";
pub const STEP_REQUEST_PLC_TOKEN: &str = "request_plc_token";
pub const STEP_DIRECTORY_UPDATE: &str = "submit_directory_op";
pub const STEP_ACTIVATE: &str = "activate_account";

/// Dispatches a dequeued [`crate::jobs::queue::Job`] to its phase handler
/// by step name. Unknown steps are a configuration bug, not a runtime
/// condition any retry policy can fix.
pub async fn dispatch<R: MigrationRepository>(
    ctx: &PhaseContext<R>,
    step: &str,
    migration_id: i64,
) -> Result<()> {
    match step {
        STEP_DOWNLOAD_BACKUP => download_backup::run(ctx, migration_id).await,
        STEP_BUILD_BACKUP => build_backup::run(ctx, migration_id).await,
        STEP_CREATE_ACCOUNT => create_account::run(ctx, migration_id).await,
        STEP_IMPORT_REPO => import_repo::run(ctx, migration_id).await,
        STEP_IMPORT_BLOBS => import_blobs::run(ctx, migration_id).await,
        STEP_IMPORT_PREFS => import_preferences::run(ctx, migration_id).await,
        STEP_REQUEST_PLC_TOKEN => request_plc_token::run(ctx, migration_id).await,
        STEP_DIRECTORY_UPDATE => directory_update::run(ctx, migration_id).await,
        STEP_ACTIVATE => activate::run(ctx, migration_id).await,
        other => Err(MigrationError::Configuration(format!("unknown job step: {other}"))),
    }
}

/// The priority a step runs on (§4.2 queues: the two irreversible phases
/// run on `critical`, all prior migration phases on `migrations`). Shared
/// by [`enqueue_next`] and the `retry` operator surface (§6.6).
pub fn priority_for_step(step: &str) -> QueuePriority {
    match step {
        STEP_DIRECTORY_UPDATE | STEP_ACTIVATE => QueuePriority::Critical,
        _ => QueuePriority::Migrations,
    }
}

/// Enqueues `step` for `migration_id` at the priority its phase runs on.
pub async fn enqueue_next<R: MigrationRepository>(ctx: &PhaseContext<R>, step: &str, migration_id: i64) {
    ctx.queue.enqueue(migration_id, step, priority_for_step(step)).await;
}

/// Maps a non-terminal status to the step that resumes work from it, used
/// by the `retry` operator surface (§6.6) once it has restored a failed
/// migration's status from `failed_from_status`. `pending_plc` resumes at
/// directory submission rather than re-requesting the email token, since
/// that is where a `pending_plc` failure almost always occurred.
pub fn entry_step_for_status(status: MigrationStatus) -> &'static str {
    use MigrationStatus::*;
    match status {
        PendingDownload => STEP_DOWNLOAD_BACKUP,
        PendingBackup => STEP_BUILD_BACKUP,
        BackupReady | PendingAccount => STEP_CREATE_ACCOUNT,
        PendingRepo => STEP_IMPORT_REPO,
        PendingBlobs => STEP_IMPORT_BLOBS,
        PendingPrefs => STEP_IMPORT_PREFS,
        PendingPlc => STEP_DIRECTORY_UPDATE,
        PendingActivation => STEP_ACTIVATE,
        Completed | Failed => STEP_ACTIVATE,
    }
}

/// Loads `migration_id` and applies the idempotency gate shared by every
/// phase (§4.6 step 1). Returns `None` (and does nothing else) when the
/// status no longer matches what this phase expects — a re-delivered or
/// racing job, not an error.
pub(crate) async fn load_expecting<R: MigrationRepository>(
    ctx: &PhaseContext<R>,
    migration_id: i64,
    expected: MigrationStatus,
) -> Result<Option<Migration>> {
    let migration = ctx.repository.load(migration_id).await?;
    if !state_machine::expects_status(&migration, expected) {
        debug!(
            migration_id,
            status = ?migration.status,
            expected = ?expected,
            "phase skipped: idempotency gate rejected stale status"
        );
        return Ok(None);
    }
    Ok(Some(migration))
}
