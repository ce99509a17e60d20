pub mod memory;
pub mod sql;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Migration, MigrationStatus};
use crate::error::{MigrationError, Result};

/// A plain repository exposing explicit `load`, `update`, `advance`,
/// `purge_credentials` methods (§9 re-architecture: replaces lazy ORM
/// associations and save-callbacks with explicit calls).
#[async_trait]
pub trait MigrationRepository: Send + Sync {
    async fn create(&self, migration: Migration) -> Result<Migration>;
    async fn load(&self, id: i64) -> Result<Migration>;
    async fn load_by_token(&self, token: &str) -> Result<Migration>;
    async fn find_non_terminal_by_did(&self, did: &str) -> Result<Option<Migration>>;
    async fn update(&self, migration: &Migration) -> Result<()>;
    async fn count_in_status(&self, status: MigrationStatus) -> Result<u64>;
    async fn list_failed_matching(&self, needle: &str) -> Result<Vec<Migration>>;
    /// Every non-terminal, non-`failed` migration, used by the server's
    /// startup recovery sweep to re-enqueue work the in-process job queue
    /// lost on the previous restart (§8 resume semantics; §1 notes a
    /// durable work-queue store is out of scope, so this is how the
    /// durable *state* and the ephemeral *queue* are reconciled).
    async fn list_non_terminal(&self) -> Result<Vec<Migration>>;
    /// Backup bundles whose retention window has elapsed as of `now`
    /// (§6.3 "Housekeeper deletes").
    async fn list_expired_backups(&self, now: DateTime<Utc>) -> Result<Vec<Migration>>;
    /// Terminal migrations older than `cutoff`, re-checked defensively
    /// even though `mark_complete`/`mark_failed` already purge most
    /// credential fields on the happy path (§2 Housekeeper).
    async fn list_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Migration>>;
}

pub(crate) fn not_found(what: &str) -> MigrationError {
    MigrationError::Storage {
        source: crate::error::StorageError::NotFound(what.to_string()),
        context: "migration repository".to_string(),
    }
}
