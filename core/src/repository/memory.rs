use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Migration, MigrationStatus};
use crate::error::Result;

use super::{not_found, MigrationRepository};

/// In-memory fake used by integration tests (§8 seed scenarios) and by
/// any harness exercising the orchestrator without a live Postgres
/// instance (§1: "Persistence substrate... assumed" is out of scope).
#[derive(Default)]
pub struct InMemoryMigrationRepository {
    by_id: Mutex<HashMap<i64, Migration>>,
    next_id: Mutex<i64>,
}

impl InMemoryMigrationRepository {
    pub fn new() -> Self {
        Self {
            by_id: Mutex::new(HashMap::new()),
            next_id: Mutex::new(1),
        }
    }
}

#[async_trait]
impl MigrationRepository for InMemoryMigrationRepository {
    async fn create(&self, mut migration: Migration) -> Result<Migration> {
        let mut next_id = self.next_id.lock().unwrap();
        migration.id = *next_id;
        *next_id += 1;
        self.by_id.lock().unwrap().insert(migration.id, migration.clone());
        Ok(migration)
    }

    async fn load(&self, id: i64) -> Result<Migration> {
        self.by_id
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found(&format!("migration id {id}")))
    }

    async fn load_by_token(&self, token: &str) -> Result<Migration> {
        self.by_id
            .lock()
            .unwrap()
            .values()
            .find(|m| m.token == token)
            .cloned()
            .ok_or_else(|| not_found(&format!("migration token {token}")))
    }

    async fn find_non_terminal_by_did(&self, did: &str) -> Result<Option<Migration>> {
        Ok(self
            .by_id
            .lock()
            .unwrap()
            .values()
            .find(|m| m.did == did && !m.status.is_terminal())
            .cloned())
    }

    async fn update(&self, migration: &Migration) -> Result<()> {
        let mut map = self.by_id.lock().unwrap();
        if !map.contains_key(&migration.id) {
            return Err(not_found(&format!("migration id {}", migration.id)));
        }
        map.insert(migration.id, migration.clone());
        Ok(())
    }

    async fn count_in_status(&self, status: MigrationStatus) -> Result<u64> {
        Ok(self
            .by_id
            .lock()
            .unwrap()
            .values()
            .filter(|m| m.status == status)
            .count() as u64)
    }

    async fn list_failed_matching(&self, needle: &str) -> Result<Vec<Migration>> {
        Ok(self
            .by_id
            .lock()
            .unwrap()
            .values()
            .filter(|m| {
                m.status == MigrationStatus::Failed
                    && m.last_error
                        .as_deref()
                        .map(|e| e.to_lowercase().contains(&needle.to_lowercase()))
                        .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn list_expired_backups(&self, now: DateTime<Utc>) -> Result<Vec<Migration>> {
        Ok(self
            .by_id
            .lock()
            .unwrap()
            .values()
            .filter(|m| m.backup_bundle_path.is_some() && m.backup_expires_at.map(|e| e <= now).unwrap_or(false))
            .cloned()
            .collect())
    }

    async fn list_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Migration>> {
        Ok(self
            .by_id
            .lock()
            .unwrap()
            .values()
            .filter(|m| m.status.is_terminal() && m.updated_at <= cutoff)
            .cloned()
            .collect())
    }

    async fn list_non_terminal(&self) -> Result<Vec<Migration>> {
        Ok(self
            .by_id
            .lock()
            .unwrap()
            .values()
            .filter(|m| !m.status.is_terminal())
            .cloned()
            .collect())
    }
}
