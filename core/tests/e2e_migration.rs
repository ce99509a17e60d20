//! End-to-end phase-chain tests against mocked old/new PDS hosts (§8 seed
//! scenarios). Every XRPC call the orchestrator makes is served by a
//! `wiremock` mock server standing in for the source and target PDS; the
//! job queue and repository are the in-process fakes already used by the
//! unit suites (`JobQueue`, `InMemoryMigrationRepository`).

use std::sync::Arc;

use chrono::Utc;
use migration_core::config::{Config, DeploymentMode, InviteCodeMode};
use migration_core::domain::{FailureTag, Migration, MigrationStatus, MigrationType, ProgressData};
use migration_core::error::ErrorKind;
use migration_core::jobs::queue::{JobQueue, QueuePriority};
use migration_core::jobs::retry;
use migration_core::orchestrator::phases::{
    self, STEP_ACTIVATE, STEP_CREATE_ACCOUNT, STEP_DIRECTORY_UPDATE, STEP_IMPORT_BLOBS,
    STEP_IMPORT_PREFS, STEP_IMPORT_REPO, STEP_REQUEST_PLC_TOKEN,
};
use migration_core::orchestrator::PhaseContext;
use migration_core::protocol::PdsClient;
use migration_core::repository::memory::InMemoryMigrationRepository;
use migration_core::repository::MigrationRepository;
use migration_core::state_machine;
use migration_core::vault::{ttl, Encrypted, SecretVault};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config(work_root: &std::path::Path, max_concurrent: u64) -> Config {
    Config {
        master_key_hex: None,
        max_concurrent_migrations: max_concurrent,
        directory_host: "https://plc.directory".to_string(),
        target_pds_host: None,
        deployment_mode: DeploymentMode::Standalone,
        invite_code_mode: InviteCodeMode::Optional,
        work_root: work_root.display().to_string(),
        database_url: None,
    }
}

fn fresh_migration(old_pds: &str, new_pds: &str, create_backup_bundle: bool) -> Migration {
    Migration {
        id: 0,
        token: "mig_AAAAAAAAAAAAAAAA".to_string(),
        did: "did:plc:abc123migrate".to_string(),
        email: "alice@example.test".to_string(),
        old_handle: "alice.old.example".to_string(),
        new_handle: "alice.new.example".to_string(),
        old_pds_host: old_pds.to_string(),
        new_pds_host: new_pds.to_string(),
        status: MigrationStatus::PendingAccount,
        migration_type: MigrationType::MigrationOut,
        progress_data: ProgressData::new(),
        estimated_memory_mb: 64,
        old_password: Encrypted::empty(),
        old_access_jwt: Encrypted::empty(),
        old_refresh_jwt: Encrypted::empty(),
        new_access_jwt: Encrypted::empty(),
        new_refresh_jwt: Encrypted::empty(),
        directory_one_time_token: Encrypted::empty(),
        invite_code: Encrypted::empty(),
        rotation_private_key: Encrypted::empty(),
        backup_bundle_path: None,
        backup_created_at: None,
        backup_expires_at: None,
        downloaded_data_path: None,
        last_error: None,
        retry_count: 0,
        current_job_step: None,
        current_job_attempt: 0,
        current_job_max_attempts: 3,
        email_verified_at: Some(Utc::now()),
        email_verification_token: None,
        create_backup_bundle,
        failure_tag: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

/// Seeds a migration with already-live source/target sessions and a live
/// directory one-time token, skipping every login round trip (the same
/// cached-token short-circuit exercised by `orchestrator::session`'s own
/// unit tests).
fn seed_live_credentials(migration: &mut Migration, vault: &SecretVault) {
    migration.old_password = vault.seal(&"sourcepw123".to_string(), ttl::source_password()).unwrap();
    migration.old_access_jwt = vault.seal(&"old-access".to_string(), ttl::session_tokens()).unwrap();
    migration.old_refresh_jwt = vault.seal(&"old-refresh".to_string(), ttl::session_tokens()).unwrap();
    migration.directory_one_time_token = vault.seal(&"one-time-plc-token".to_string(), ttl::directory_one_time_token()).unwrap();
}

async fn new_ctx(
    repository: Arc<InMemoryMigrationRepository>,
    vault: Arc<SecretVault>,
    work_root: &std::path::Path,
    max_concurrent: u64,
) -> PhaseContext<InMemoryMigrationRepository> {
    PhaseContext::new(
        repository,
        Arc::new(PdsClient::new().unwrap()),
        vault,
        Arc::new(JobQueue::new()),
        Arc::new(test_config(work_root, max_concurrent)),
    )
}

fn recommended_op_body() -> serde_json::Value {
    json!({
        "rotationKeys": ["did:key:zExistingRotationKey"],
        "alsoKnownAs": ["at://alice.new.example"],
        "verificationMethods": {},
        "services": {},
    })
}

async fn mount_create_account_success(new_pds: &MockServer, old_pds: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/xrpc/com.atproto.server.describeServer"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"did": "did:web:new.example"})))
        .mount(new_pds)
        .await;
    Mock::given(method("GET"))
        .and(path("/xrpc/com.atproto.server.getServiceAuth"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "service-auth-token"})))
        .mount(old_pds)
        .await;
    Mock::given(method("POST"))
        .and(path("/xrpc/com.atproto.server.createAccount"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "accessJwt": "new-access",
            "refreshJwt": "new-refresh",
            "did": "did:plc:abc123migrate",
            "handle": "alice.new.example",
        })))
        .mount(new_pds)
        .await;
}

async fn mount_import_repo(old_pds: &MockServer, new_pds: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/xrpc/com.atproto.sync.getRepo"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"car-bytes-not-really-a-car".to_vec()))
        .mount(old_pds)
        .await;
    Mock::given(method("POST"))
        .and(path("/xrpc/com.atproto.repo.importRepo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(new_pds)
        .await;
}

async fn mount_preferences(old_pds: &MockServer, new_pds: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/xrpc/app.bsky.actor.getPreferences"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"preferences": []})))
        .mount(old_pds)
        .await;
    Mock::given(method("POST"))
        .and(path("/xrpc/app.bsky.actor.putPreferences"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(new_pds)
        .await;
}

async fn mount_plc_and_activation(old_pds: &MockServer, new_pds: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/xrpc/com.atproto.identity.requestPlcOperationSignature"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(old_pds)
        .await;
    Mock::given(method("GET"))
        .and(path("/xrpc/com.atproto.identity.getRecommendedDidCredentials"))
        .respond_with(ResponseTemplate::new(200).set_body_json(recommended_op_body()))
        .mount(new_pds)
        .await;
    Mock::given(method("POST"))
        .and(path("/xrpc/com.atproto.identity.signPlcOperation"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"operation": {"sig": "abc"}})))
        .mount(old_pds)
        .await;
    Mock::given(method("POST"))
        .and(path("/xrpc/com.atproto.identity.submitPlcOperation"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(new_pds)
        .await;
    Mock::given(method("POST"))
        .and(path("/xrpc/com.atproto.server.activateAccount"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(new_pds)
        .await;
    Mock::given(method("POST"))
        .and(path("/xrpc/com.atproto.server.deactivateAccount"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(old_pds)
        .await;
    Mock::given(method("POST"))
        .and(path("/xrpc/com.atproto.identity.updateIdentity"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(new_pds)
        .await;
}

/// Scenario 1 (§8): happy path without a backup bundle, streamed blob
/// engine, one blob to migrate.
#[tokio::test]
async fn happy_path_without_backup_reaches_completed() {
    let old_pds = MockServer::start().await;
    let new_pds = MockServer::start().await;
    let work_dir = tempfile::tempdir().unwrap();

    mount_create_account_success(&new_pds, &old_pds).await;
    mount_import_repo(&old_pds, &new_pds).await;
    Mock::given(method("GET"))
        .and(path("/xrpc/com.atproto.sync.listBlobs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"cids": ["bafyblob1"]})))
        .mount(&old_pds)
        .await;
    Mock::given(method("GET"))
        .and(path("/xrpc/com.atproto.sync.getBlob"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"blob-bytes".to_vec()))
        .mount(&old_pds)
        .await;
    Mock::given(method("POST"))
        .and(path("/xrpc/com.atproto.repo.uploadBlob"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&new_pds)
        .await;
    mount_preferences(&old_pds, &new_pds).await;
    mount_plc_and_activation(&old_pds, &new_pds).await;

    let vault = Arc::new(SecretVault::development_key());
    let repo = Arc::new(InMemoryMigrationRepository::new());
    let mut migration = fresh_migration(&old_pds.uri(), &new_pds.uri(), false);
    seed_live_credentials(&mut migration, &vault);
    let migration = repo.create(migration).await.unwrap();
    let ctx = new_ctx(repo.clone(), vault, work_dir.path(), 15).await;

    for step in [
        STEP_CREATE_ACCOUNT,
        STEP_IMPORT_REPO,
        STEP_IMPORT_BLOBS,
        STEP_IMPORT_PREFS,
        STEP_REQUEST_PLC_TOKEN,
        STEP_DIRECTORY_UPDATE,
        STEP_ACTIVATE,
    ] {
        phases::dispatch(&ctx, step, migration.id).await.unwrap();
    }

    let finished = repo.load(migration.id).await.unwrap();
    assert_eq!(finished.status, MigrationStatus::Completed);
    assert!(finished.progress_data.get_timestamp("completed_at").is_some());
    assert_eq!(finished.progress_data.get_counter("blob_count"), Some(1));
    assert_eq!(finished.progress_data.get_counter("blobs_completed"), Some(1));
    assert!(finished.old_password.is_empty(), "credentials must be purged on completion");
    assert!(!finished.rotation_private_key.is_empty(), "rotation key is retained");
}

/// Scenario 2 (§8): happy path with a backup bundle requested, exercising
/// the two-phase `ConcurrentBlobMigration` engine and `download_backup` /
/// `build_backup`.
#[tokio::test]
async fn happy_path_with_backup_bundle_builds_archive_then_completes() {
    let old_pds = MockServer::start().await;
    let new_pds = MockServer::start().await;
    let work_dir = tempfile::tempdir().unwrap();

    Mock::given(method("GET"))
        .and(path("/xrpc/com.atproto.sync.listBlobs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"cids": ["bafyblob1"]})))
        .mount(&old_pds)
        .await;
    Mock::given(method("GET"))
        .and(path("/xrpc/com.atproto.sync.getBlob"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"blob-bytes".to_vec()))
        .mount(&old_pds)
        .await;
    Mock::given(method("POST"))
        .and(path("/xrpc/com.atproto.repo.uploadBlob"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&new_pds)
        .await;
    mount_create_account_success(&new_pds, &old_pds).await;
    mount_import_repo(&old_pds, &new_pds).await;
    mount_preferences(&old_pds, &new_pds).await;
    mount_plc_and_activation(&old_pds, &new_pds).await;

    let vault = Arc::new(SecretVault::development_key());
    let repo = Arc::new(InMemoryMigrationRepository::new());
    let mut migration = fresh_migration(&old_pds.uri(), &new_pds.uri(), true);
    migration.status = MigrationStatus::PendingDownload;
    seed_live_credentials(&mut migration, &vault);
    let migration = repo.create(migration).await.unwrap();
    let ctx = new_ctx(repo.clone(), vault, work_dir.path(), 15).await;

    phases::dispatch(&ctx, phases::STEP_DOWNLOAD_BACKUP, migration.id).await.unwrap();
    let after_download = repo.load(migration.id).await.unwrap();
    assert_eq!(after_download.status, MigrationStatus::PendingBackup);

    phases::dispatch(&ctx, phases::STEP_BUILD_BACKUP, migration.id).await.unwrap();
    let after_build = repo.load(migration.id).await.unwrap();
    assert_eq!(after_build.status, MigrationStatus::PendingAccount);
    assert!(after_build.backup_bundle_path.is_some());
    assert!(tokio::fs::metadata(after_build.backup_bundle_path.as_ref().unwrap()).await.is_ok());

    for step in [
        STEP_CREATE_ACCOUNT,
        STEP_IMPORT_REPO,
        STEP_IMPORT_BLOBS,
        STEP_IMPORT_PREFS,
        STEP_REQUEST_PLC_TOKEN,
        STEP_DIRECTORY_UPDATE,
        STEP_ACTIVATE,
    ] {
        phases::dispatch(&ctx, step, migration.id).await.unwrap();
    }

    let finished = repo.load(migration.id).await.unwrap();
    assert_eq!(finished.status, MigrationStatus::Completed);
    assert_eq!(finished.progress_data.get_counter("blobs_uploaded"), Some(1));
}

/// Scenario 3 (§8): one blob exhausts its retry budget and is recorded as
/// failed, but the migration still advances to `pending_prefs`. Uses a
/// paused clock so the streamed engine's real `tokio::time::sleep` backoff
/// doesn't cost real wall-clock time.
#[tokio::test(start_paused = true)]
async fn one_failing_blob_is_recorded_but_migration_proceeds() {
    let old_pds = MockServer::start().await;
    let new_pds = MockServer::start().await;
    let work_dir = tempfile::tempdir().unwrap();

    Mock::given(method("GET"))
        .and(path("/xrpc/com.atproto.sync.listBlobs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"cids": ["bafybad", "bafygood"]})))
        .mount(&old_pds)
        .await;
    Mock::given(method("GET"))
        .and(path("/xrpc/com.atproto.sync.getBlob"))
        .and(wiremock::matchers::query_param("cid", "bafybad"))
        .respond_with(ResponseTemplate::new(500).set_body_string("server error"))
        .mount(&old_pds)
        .await;
    Mock::given(method("GET"))
        .and(path("/xrpc/com.atproto.sync.getBlob"))
        .and(wiremock::matchers::query_param("cid", "bafygood"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"good-bytes".to_vec()))
        .mount(&old_pds)
        .await;
    Mock::given(method("POST"))
        .and(path("/xrpc/com.atproto.repo.uploadBlob"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&new_pds)
        .await;

    let vault = Arc::new(SecretVault::development_key());
    let repo = Arc::new(InMemoryMigrationRepository::new());
    let mut migration = fresh_migration(&old_pds.uri(), &new_pds.uri(), false);
    migration.status = MigrationStatus::PendingBlobs;
    seed_live_credentials(&mut migration, &vault);
    migration.new_access_jwt = vault.seal(&"new-access".to_string(), ttl::session_tokens()).unwrap();
    migration.new_refresh_jwt = vault.seal(&"new-refresh".to_string(), ttl::session_tokens()).unwrap();
    let migration = repo.create(migration).await.unwrap();
    let ctx = new_ctx(repo.clone(), vault, work_dir.path(), 15).await;

    phases::dispatch(&ctx, STEP_IMPORT_BLOBS, migration.id).await.unwrap();

    let after = repo.load(migration.id).await.unwrap();
    assert_eq!(after.status, MigrationStatus::PendingPrefs);
    assert_eq!(after.progress_data.get_counter("blob_count"), Some(2));
    assert_eq!(after.progress_data.get_counter("blobs_completed"), Some(1));
    assert_eq!(after.progress_data.get_failed_blobs("failed_blobs"), vec!["bafybad".to_string()]);
}

/// Scenario 4 (§8): the target already has an orphaned deactivated account
/// for this DID. `createAccount` returns a non-resumable `AlreadyExists`;
/// the admin lookup confirms `deactivated=true`. The migration must end
/// `failed` with a `last_error` calling out the orphaned account, and the
/// error must not be retried (no `max_attempts` budget for `AccountExists`).
#[tokio::test]
async fn orphaned_deactivated_account_fails_without_retry() {
    let old_pds = MockServer::start().await;
    let new_pds = MockServer::start().await;
    let work_dir = tempfile::tempdir().unwrap();

    Mock::given(method("GET"))
        .and(path("/xrpc/com.atproto.server.describeServer"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"did": "did:web:new.example"})))
        .mount(&new_pds)
        .await;
    Mock::given(method("GET"))
        .and(path("/xrpc/com.atproto.server.getServiceAuth"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "service-auth-token"})))
        .mount(&old_pds)
        .await;
    Mock::given(method("POST"))
        .and(path("/xrpc/com.atproto.server.createAccount"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "AlreadyExists",
            "message": "did already registered",
        })))
        .mount(&new_pds)
        .await;
    Mock::given(method("GET"))
        .and(path("/xrpc/com.atproto.admin.getAccountInfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "did": "did:plc:abc123migrate",
            "handle": "alice.new.example",
            "deactivatedAt": "2026-01-01T00:00:00Z",
        })))
        .mount(&new_pds)
        .await;

    let vault = Arc::new(SecretVault::development_key());
    let repo = Arc::new(InMemoryMigrationRepository::new());
    let mut migration = fresh_migration(&old_pds.uri(), &new_pds.uri(), false);
    seed_live_credentials(&mut migration, &vault);
    let migration = repo.create(migration).await.unwrap();
    let ctx = new_ctx(repo.clone(), vault, work_dir.path(), 15).await;

    let err = phases::dispatch(&ctx, STEP_CREATE_ACCOUNT, migration.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AccountExists);
    assert!(!retry::should_retry(err.kind(), 0, false, false), "AccountExists must never retry");

    let mut failed = repo.load(migration.id).await.unwrap();
    state_machine::mark_failed(&mut failed, err.to_string()).unwrap();
    repo.update(&failed).await.unwrap();

    let stored = repo.load(migration.id).await.unwrap();
    assert_eq!(stored.status, MigrationStatus::Failed);
    assert_ne!(stored.failure_tag, Some(FailureTag::Cancelled));
    assert!(stored.last_error.as_ref().unwrap().contains("Orphaned deactivated account"));
}

/// Scenario 5 (§8): admission control at exactly the concurrency cap
/// re-enqueues the blob-phase job instead of proceeding; one below the cap
/// proceeds.
#[tokio::test]
async fn admission_control_gates_at_the_concurrency_cap() {
    let old_pds = MockServer::start().await;
    let new_pds = MockServer::start().await;
    let work_dir = tempfile::tempdir().unwrap();

    Mock::given(method("GET"))
        .and(path("/xrpc/com.atproto.sync.listBlobs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"cids": []})))
        .mount(&old_pds)
        .await;

    let vault = Arc::new(SecretVault::development_key());
    let repo = Arc::new(InMemoryMigrationRepository::new());

    // Cap of 2: seed two other migrations already in pending_blobs so the
    // subject migration observes exactly 2 in-flight peers (itself makes 3,
    // over the cap of 2) and must be denied admission.
    for _ in 0..2 {
        let mut filler = fresh_migration(&old_pds.uri(), &new_pds.uri(), false);
        filler.status = MigrationStatus::PendingBlobs;
        repo.create(filler).await.unwrap();
    }

    let mut migration = fresh_migration(&old_pds.uri(), &new_pds.uri(), false);
    migration.status = MigrationStatus::PendingBlobs;
    seed_live_credentials(&mut migration, &vault);
    migration.new_access_jwt = vault.seal(&"new-access".to_string(), ttl::session_tokens()).unwrap();
    migration.new_refresh_jwt = vault.seal(&"new-refresh".to_string(), ttl::session_tokens()).unwrap();
    let migration = repo.create(migration).await.unwrap();
    let ctx = new_ctx(repo.clone(), vault.clone(), work_dir.path(), 2).await;

    phases::dispatch(&ctx, STEP_IMPORT_BLOBS, migration.id).await.unwrap();
    let still_pending = repo.load(migration.id).await.unwrap();
    assert_eq!(still_pending.status, MigrationStatus::PendingBlobs, "denied admission must not advance");
    assert_eq!(ctx.queue.len().await, 1, "denied admission must requeue the job");

    // Drop one filler below the cap: now only 1 other in-flight peer, cap-1,
    // so admission proceeds through to pending_prefs.
    let mut fillers = repo.list_non_terminal().await.unwrap();
    fillers.retain(|m| m.id != migration.id);
    let mut one_filler = fillers.remove(0);
    one_filler.status = MigrationStatus::Completed;
    repo.update(&one_filler).await.unwrap();

    phases::dispatch(&ctx, STEP_IMPORT_BLOBS, migration.id).await.unwrap();
    let advanced = repo.load(migration.id).await.unwrap();
    assert_eq!(advanced.status, MigrationStatus::PendingPrefs, "admission at cap-1 must proceed");
}

/// Scenario 6 (§8): `submitPlcOperation` fails once. Because this step runs
/// on the critical queue, `ErrorKind::Protocol` caps retries at a single
/// attempt — the job runtime must not retry and the migration ends
/// `failed` immediately.
#[tokio::test]
async fn directory_submit_failure_is_not_retried_on_the_critical_queue() {
    let old_pds = MockServer::start().await;
    let new_pds = MockServer::start().await;
    let work_dir = tempfile::tempdir().unwrap();

    Mock::given(method("GET"))
        .and(path("/xrpc/com.atproto.identity.getRecommendedDidCredentials"))
        .respond_with(ResponseTemplate::new(200).set_body_json(recommended_op_body()))
        .mount(&new_pds)
        .await;
    Mock::given(method("POST"))
        .and(path("/xrpc/com.atproto.identity.signPlcOperation"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"operation": {"sig": "abc"}})))
        .mount(&old_pds)
        .await;
    Mock::given(method("POST"))
        .and(path("/xrpc/com.atproto.identity.submitPlcOperation"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
        .mount(&new_pds)
        .await;

    let vault = Arc::new(SecretVault::development_key());
    let repo = Arc::new(InMemoryMigrationRepository::new());
    let mut migration = fresh_migration(&old_pds.uri(), &new_pds.uri(), false);
    migration.status = MigrationStatus::PendingPlc;
    seed_live_credentials(&mut migration, &vault);
    migration.new_access_jwt = vault.seal(&"new-access".to_string(), ttl::session_tokens()).unwrap();
    migration.new_refresh_jwt = vault.seal(&"new-refresh".to_string(), ttl::session_tokens()).unwrap();
    let migration = repo.create(migration).await.unwrap();
    let ctx = new_ctx(repo.clone(), vault, work_dir.path(), 15).await;

    let err = phases::dispatch(&ctx, STEP_DIRECTORY_UPDATE, migration.id).await.unwrap_err();
    let kind = err.kind();
    let on_critical = true; // directory_update/activate run on the critical queue (§4.2).
    assert!(!retry::should_retry(kind, 0, on_critical, false), "a single critical Protocol failure must not retry");

    let mut failed = repo.load(migration.id).await.unwrap();
    state_machine::mark_failed(&mut failed, err.to_string()).unwrap();
    repo.update(&failed).await.unwrap();

    let stored = repo.load(migration.id).await.unwrap();
    assert_eq!(stored.status, MigrationStatus::Failed);
    assert_eq!(ctx.queue.len().await, 0, "no retry job should have been enqueued");

    // Also confirm admission-gated priority assignment for this step — it
    // must be the critical queue, matching the retry ceiling just asserted.
    assert_eq!(phases::priority_for_step(STEP_DIRECTORY_UPDATE), QueuePriority::Critical);
}
