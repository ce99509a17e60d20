use chrono::Utc;
use tracing::{info, warn};

use crate::domain::Migration;
use crate::error::MigrationError;
use crate::protocol::PdsClient;
use crate::repository::MigrationRepository;
use crate::vault::{ttl, SecretVault};

/// A live bearer pair for one of the two PDS hosts, resolved by whichever
/// of the §4.3 acquisition strategies applies and persisted back onto the
/// migration record so the next phase doesn't repeat the work.
pub struct AuthSession {
    pub access_jwt: String,
    pub refresh_jwt: String,
}

/// Source-PDS session (§4.3 "Refresh-token-based... persisted-refresh
/// callback on rotation"). Tries a cached access token, then a refresh,
/// then a fresh password login; whichever path succeeds reseals both
/// tokens into the migration record and persists it immediately so a
/// crash between here and the next phase boundary doesn't lose the
/// rotation.
pub async fn ensure_source_session<R: MigrationRepository>(
    migration: &mut Migration,
    client: &PdsClient,
    vault: &SecretVault,
    repository: &R,
) -> Result<AuthSession, MigrationError> {
    let now = Utc::now();

    if let (Some(access_jwt), Some(refresh_jwt)) = (
        vault.open(&migration.old_access_jwt, now),
        vault.open(&migration.old_refresh_jwt, now),
    ) {
        return Ok(AuthSession {
            access_jwt,
            refresh_jwt,
        });
    }

    if let Some(refresh_jwt) = vault.open(&migration.old_refresh_jwt, now) {
        match client.refresh_session(&migration.old_pds_host, &refresh_jwt).await {
            Ok(session) => {
                reseal_source_tokens(migration, vault, &session.access_jwt, &session.refresh_jwt)?;
                repository.update(migration).await?;
                return Ok(AuthSession {
                    access_jwt: session.access_jwt,
                    refresh_jwt: session.refresh_jwt,
                });
            }
            Err(e) => {
                warn!(did = %migration.did, error = %e, "source refresh failed, falling back to password login");
            }
        }
    }

    let password = vault.open(&migration.old_password, now).ok_or_else(|| {
        MigrationError::Authentication("source-PDS password expired or missing".to_string())
    })?;

    let login = client
        .try_login_at(&migration.old_handle, &password, &migration.old_pds_host)
        .await
        .map_err(MigrationError::PdsClient)?;
    if !login.success {
        return Err(MigrationError::Authentication(login.message));
    }
    let session = login.session.expect("login.success implies session is set");

    reseal_source_tokens(migration, vault, &session.access_jwt, &session.refresh_jwt)?;
    repository.update(migration).await?;
    info!(did = %migration.did, "source session established via password login");
    Ok(AuthSession {
        access_jwt: session.access_jwt,
        refresh_jwt: session.refresh_jwt,
    })
}

/// Target-PDS session. `migration_out` accounts are created directly with
/// a known password (no prior session to resume); `migration_in`
/// accounts resume via the same cached/refresh/password ladder as the
/// source (§4.3 "Refresh-token-based (... target PDS during
/// `migration_in`)").
pub async fn ensure_target_session<R: MigrationRepository>(
    migration: &mut Migration,
    client: &PdsClient,
    vault: &SecretVault,
    repository: &R,
) -> Result<AuthSession, MigrationError> {
    let now = Utc::now();

    if let (Some(access_jwt), Some(refresh_jwt)) = (
        vault.open(&migration.new_access_jwt, now),
        vault.open(&migration.new_refresh_jwt, now),
    ) {
        return Ok(AuthSession {
            access_jwt,
            refresh_jwt,
        });
    }

    if let Some(refresh_jwt) = vault.open(&migration.new_refresh_jwt, now) {
        match client.refresh_session(&migration.new_pds_host, &refresh_jwt).await {
            Ok(session) => {
                reseal_target_tokens(migration, vault, &session.access_jwt, &session.refresh_jwt)?;
                repository.update(migration).await?;
                return Ok(AuthSession {
                    access_jwt: session.access_jwt,
                    refresh_jwt: session.refresh_jwt,
                });
            }
            Err(e) => {
                warn!(did = %migration.did, error = %e, "target refresh failed, falling back to password login");
            }
        }
    }

    let password = vault.open(&migration.old_password, now).ok_or_else(|| {
        MigrationError::Authentication("target-PDS password expired or missing".to_string())
    })?;
    let login = client
        .try_login_at(&migration.new_handle, &password, &migration.new_pds_host)
        .await
        .map_err(MigrationError::PdsClient)?;
    if !login.success {
        return Err(MigrationError::Authentication(login.message));
    }
    let session = login.session.expect("login.success implies session is set");

    reseal_target_tokens(migration, vault, &session.access_jwt, &session.refresh_jwt)?;
    repository.update(migration).await?;
    Ok(AuthSession {
        access_jwt: session.access_jwt,
        refresh_jwt: session.refresh_jwt,
    })
}

/// Installs a newly created account's session directly (no login round
/// trip needed — `createAccount` already returned tokens), §4.6 "Create
/// Account" phase.
pub fn install_target_session(
    migration: &mut Migration,
    vault: &SecretVault,
    access_jwt: &str,
    refresh_jwt: &str,
) -> Result<(), MigrationError> {
    reseal_target_tokens(migration, vault, access_jwt, refresh_jwt)
}

fn reseal_source_tokens(
    migration: &mut Migration,
    vault: &SecretVault,
    access_jwt: &str,
    refresh_jwt: &str,
) -> Result<(), MigrationError> {
    migration.old_access_jwt = vault.seal(&access_jwt.to_string(), ttl::session_tokens())?;
    migration.old_refresh_jwt = vault.seal(&refresh_jwt.to_string(), ttl::session_tokens())?;
    Ok(())
}

fn reseal_target_tokens(
    migration: &mut Migration,
    vault: &SecretVault,
    access_jwt: &str,
    refresh_jwt: &str,
) -> Result<(), MigrationError> {
    migration.new_access_jwt = vault.seal(&access_jwt.to_string(), ttl::session_tokens())?;
    migration.new_refresh_jwt = vault.seal(&refresh_jwt.to_string(), ttl::session_tokens())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MigrationStatus, MigrationType, ProgressData};
    use crate::repository::memory::InMemoryMigrationRepository;
    use crate::vault::Encrypted;

    fn fresh_migration() -> Migration {
        Migration {
            id: 0,
            token: "mig_AAAAAAAAAAAAAAAA".to_string(),
            did: "did:plc:abc".to_string(),
            email: "a@x.test".to_string(),
            old_handle: "u.old.example".to_string(),
            new_handle: "u.new.example".to_string(),
            old_pds_host: "https://old.example".to_string(),
            new_pds_host: "https://new.example".to_string(),
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
            create_backup_bundle: false,
            failure_tag: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn cached_token_is_reused_without_network_call() {
        let vault = SecretVault::development_key();
        let repo = InMemoryMigrationRepository::new();
        let client = PdsClient::new().unwrap();
        let mut m = fresh_migration();
        m.old_access_jwt = vault.seal(&"cached-access".to_string(), ttl::session_tokens()).unwrap();
        m.old_refresh_jwt = vault.seal(&"cached-refresh".to_string(), ttl::session_tokens()).unwrap();

        let session = ensure_source_session(&mut m, &client, &vault, &repo).await.unwrap();
        assert_eq!(session.access_jwt, "cached-access");
    }

    #[tokio::test]
    async fn missing_everything_is_an_authentication_error() {
        let vault = SecretVault::development_key();
        let repo = InMemoryMigrationRepository::new();
        let client = PdsClient::new().unwrap();
        let mut m = fresh_migration();

        let err = ensure_source_session(&mut m, &client, &vault, &repo).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Authentication);
    }
}
