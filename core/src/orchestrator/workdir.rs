use std::path::{Path, PathBuf};

use crate::domain::Migration;
use crate::error::{MigrationError, Result, StorageError};

/// Per-migration scratch directory, namespaced under the DID (§5 "Shared
/// resources... created under the migration's DID"). This is the only
/// directory any phase job for this migration is allowed to write to,
/// which also satisfies the §5 session-isolation rule vacuously: there is
/// no shared session-file tool in this implementation (direct-protocol
/// only, see DESIGN.md Open Questions #1), but every phase still gets a
/// directory scoped to exactly one migration.
pub async fn ensure(work_root: &Path, migration: &Migration) -> Result<PathBuf> {
    let sanitized_did = migration.did.replace([':', '/'], "_");
    let dir = work_root.join(format!("{}-{}", migration.id, sanitized_did));
    tokio::fs::create_dir_all(&dir).await.map_err(|e| MigrationError::Storage {
        source: StorageError::Backend(format!("failed to create work dir {}: {e}", dir.display())),
        context: "orchestrator work directory".to_string(),
    })?;
    Ok(dir)
}
