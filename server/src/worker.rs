use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use migration_core::error::{ErrorKind, MigrationError};
use migration_core::jobs::backoff::{self, next_backoff, BackoffConfig};
use migration_core::jobs::queue::{JobQueue, QueuePriority};
use migration_core::jobs::retry;
use migration_core::orchestrator::phases::{self, STEP_ACTIVATE, STEP_DIRECTORY_UPDATE, STEP_IMPORT_REPO};
use migration_core::orchestrator::PhaseContext;
use migration_core::repository::MigrationRepository;
use migration_core::state_machine;
use tracing::{error, info, warn};

/// Idle sleep between empty polls of the queue (§4.2 job runtime: no
/// durable work-queue store is in scope, so this process is the only
/// consumer and a tight poll loop is wasteful rather than harmful).
const POLL_IDLE: StdDuration = StdDuration::from_millis(250);

/// Pops ready jobs off `ctx.queue` and dispatches them forever. One of
/// these runs per worker task; `concurrency` workers are spawned from
/// `main` so that a slow phase (e.g. a large repo import) doesn't stall
/// unrelated migrations (§4.2).
pub async fn run<R: MigrationRepository + 'static>(ctx: PhaseContext<R>, worker_id: usize) {
    info!(worker_id, "worker started");
    loop {
        let Some(job) = ctx.queue.dequeue_ready().await else {
            tokio::time::sleep(POLL_IDLE).await;
            continue;
        };

        let migration_id = job.migration_id;
        let step = job.step.clone();
        if let Err(e) = record_attempt(&ctx, migration_id, &step, job.attempt).await {
            warn!(worker_id, migration_id, error = %e, "failed to record job attempt, dispatching anyway");
        }

        match phases::dispatch(&ctx, &step, migration_id).await {
            Ok(()) => {
                info!(worker_id, migration_id, step = %step, "job completed");
            }
            Err(err) => handle_failure(&ctx.queue, &ctx.repository, migration_id, &step, job.attempt, job.priority, err).await,
        }
    }
}

async fn record_attempt<R: MigrationRepository>(
    ctx: &PhaseContext<R>,
    migration_id: i64,
    step: &str,
    attempt: u32,
) -> migration_core::error::Result<()> {
    let mut migration = ctx.repository.load(migration_id).await?;
    migration.current_job_step = Some(step.to_string());
    migration.current_job_attempt = attempt as i32;
    ctx.repository.update(&migration).await
}

/// §4.2 retry policy dispatch: classifies the error, decides whether the
/// job runtime should retry with backoff or give up and call
/// `state_machine::mark_failed`.
async fn handle_failure<R: MigrationRepository>(
    queue: &Arc<JobQueue>,
    repository: &Arc<R>,
    migration_id: i64,
    step: &str,
    attempt: u32,
    priority: QueuePriority,
    err: MigrationError,
) {
    let kind = err.kind();
    let on_critical = matches!(step, STEP_DIRECTORY_UPDATE | STEP_ACTIVATE);
    let heavy_repo_upload = step == STEP_IMPORT_REPO;

    if retry::should_retry(kind, attempt, on_critical, heavy_repo_upload) {
        // §4.2 retry policy table: rate-limited attempts back off on a
        // polynomial schedule, distinct from the exponential default used
        // for every other retryable error class.
        let delay = if kind == ErrorKind::RateLimit {
            backoff::rate_limit_backoff(attempt)
        } else {
            next_backoff(attempt, &BackoffConfig::default())
        };
        warn!(
            migration_id,
            step,
            attempt,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "job failed, retrying with backoff"
        );
        queue
            .enqueue_delayed(migration_id, step, priority, Duration::milliseconds(delay.as_millis() as i64))
            .await;
        return;
    }

    error!(migration_id, step, attempt, error = %err, "job failed permanently, marking migration failed");
    match repository.load(migration_id).await {
        Ok(mut migration) => {
            if let Err(e) = state_machine::mark_failed(&mut migration, err.to_string()) {
                error!(migration_id, error = %e, "mark_failed itself failed");
                return;
            }
            if let Err(e) = repository.update(&migration).await {
                error!(migration_id, error = %e, "failed to persist failed migration");
            }
        }
        Err(e) => error!(migration_id, error = %e, "failed to load migration to mark it failed"),
    }
}
