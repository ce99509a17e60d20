mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use migration_core::config::Config;
use migration_core::housekeeper::Housekeeper;
use migration_core::jobs::queue::JobQueue;
use migration_core::operator;
use migration_core::orchestrator::phases;
use migration_core::orchestrator::PhaseContext;
use migration_core::protocol::PdsClient;
use migration_core::repository::memory::InMemoryMigrationRepository;
use migration_core::repository::sql::PgMigrationRepository;
use migration_core::repository::MigrationRepository;
use migration_core::vault::SecretVault;
use tracing::{info, warn};

/// Number of concurrent job-runtime worker tasks (§4.2: workers pull from
/// one shared queue, so this is a pool size, not a per-priority count).
const WORKER_COUNT: usize = 4;

#[derive(Parser)]
#[command(
    name = "migration-server",
    about = "ATProto account migration orchestrator",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the job runtime and housekeeper in the foreground (default).
    Serve,
    /// List migrations in `failed` status whose last error contains `needle`.
    ListFailed {
        needle: String,
    },
    /// Reset a failed migration to the status it was in before it failed
    /// and mark it eligible for the next recovery sweep (§6.6).
    Reset {
        token: String,
    },
    /// Check whether `did` has an orphaned (deactivated) account record on
    /// `target_pds_host` — used when a prior `create_account` attempt may
    /// have partially succeeded before the process crashed (§6.6).
    CheckOrphan {
        did: String,
        target_pds_host: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .compact()
        .init();

    let args = Args::parse();
    let config = Config::from_env();

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::ListFailed { needle } => list_failed(config, &needle).await,
        Command::Reset { token } => reset(config, &token).await,
        Command::CheckOrphan { did, target_pds_host } => check_orphan(&target_pds_host, &did).await,
    }
}

async fn build_vault(config: &Config) -> Result<SecretVault> {
    match &config.master_key_hex {
        Some(hex) => SecretVault::from_hex_key(hex).context("invalid MASTER_KEY"),
        None if !config.is_production() => {
            warn!("MASTER_KEY not set, falling back to the deterministic development key");
            Ok(SecretVault::development_key())
        }
        None => anyhow::bail!("MASTER_KEY must be set in production"),
    }
}

async fn serve(config: Config) -> Result<()> {
    let config = Arc::new(config);
    let vault = Arc::new(build_vault(&config).await?);
    let queue = Arc::new(JobQueue::new());
    let client = Arc::new(PdsClient::new().context("failed to build PDS client")?);

    if let Some(database_url) = config.database_url.clone() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(&database_url)
            .await
            .context("failed to connect to database")?;
        sqlx::migrate!("../core/migrations")
            .run(&pool)
            .await
            .context("failed to run database migrations")?;
        let repository = Arc::new(PgMigrationRepository::new(pool));
        run_server(repository, client, vault, queue, config).await
    } else {
        warn!("DATABASE_URL not set, running against the in-memory repository (not durable)");
        let repository = Arc::new(InMemoryMigrationRepository::new());
        run_server(repository, client, vault, queue, config).await
    }
}

async fn run_server<R: MigrationRepository + 'static>(
    repository: Arc<R>,
    client: Arc<PdsClient>,
    vault: Arc<SecretVault>,
    queue: Arc<JobQueue>,
    config: Arc<Config>,
) -> Result<()> {
    recover_stranded_jobs(repository.as_ref(), &queue).await?;

    let housekeeper = Housekeeper::new(repository.clone(), config.work_root.clone());
    tokio::spawn(housekeeper.run());

    let ctx = PhaseContext::new(repository, client, vault, queue, config);
    let mut workers = Vec::with_capacity(WORKER_COUNT);
    for worker_id in 0..WORKER_COUNT {
        workers.push(tokio::spawn(worker::run(ctx.clone(), worker_id)));
    }

    info!(workers = WORKER_COUNT, "migration server started");
    for handle in workers {
        handle.await?;
    }
    Ok(())
}

/// Re-enqueues every non-terminal migration's resume step. The job queue
/// lives only in process memory (§1), so every restart otherwise strands
/// whatever was mid-flight.
async fn recover_stranded_jobs<R: MigrationRepository>(repository: &R, queue: &JobQueue) -> Result<()> {
    let stranded = repository.list_non_terminal().await?;
    for migration in &stranded {
        let step = phases::entry_step_for_status(migration.status);
        queue.enqueue(migration.id, step, phases::priority_for_step(step)).await;
    }
    if !stranded.is_empty() {
        info!(count = stranded.len(), "recovered stranded migrations on startup");
    }
    Ok(())
}

async fn list_failed(config: Config, needle: &str) -> Result<()> {
    let Some(database_url) = config.database_url else {
        anyhow::bail!("DATABASE_URL must be set to use operator subcommands");
    };
    let pool = sqlx::postgres::PgPoolOptions::new().connect(&database_url).await?;
    let repository = PgMigrationRepository::new(pool);

    let results = operator::list_failed(&repository, needle).await?;
    if results.is_empty() {
        println!("no failed migrations match \"{needle}\"");
    }
    for m in results {
        println!(
            "{}\t{}\t{}\t{}",
            m.token,
            m.did,
            m.retry_count,
            m.last_error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn reset(config: Config, token: &str) -> Result<()> {
    let Some(database_url) = config.database_url else {
        anyhow::bail!("DATABASE_URL must be set to use operator subcommands");
    };
    let pool = sqlx::postgres::PgPoolOptions::new().connect(&database_url).await?;
    let repository = PgMigrationRepository::new(pool);

    let from_status = operator::reset(&repository, token).await?;
    println!("migration {token} reset to {from_status:?}; will resume on the next server restart");
    Ok(())
}

async fn check_orphan(target_pds_host: &str, did: &str) -> Result<()> {
    let client = PdsClient::new().context("failed to build PDS client")?;
    let status = operator::check_orphan(&client, target_pds_host, did).await?;
    if !status.exists {
        println!("{did} has no account record on {target_pds_host}");
    } else if status.deactivated {
        println!(
            "{did} has an orphaned deactivated account on {target_pds_host} (handle: {})",
            status.handle.as_deref().unwrap_or("unknown")
        );
    } else {
        println!(
            "{did} has an active account on {target_pds_host} (handle: {})",
            status.handle.as_deref().unwrap_or("unknown")
        );
    }
    Ok(())
}
