use std::sync::Arc;

use crate::config::Config;
use crate::jobs::queue::JobQueue;
use crate::protocol::PdsClient;
use crate::repository::MigrationRepository;
use crate::vault::SecretVault;

/// Everything a phase needs to do its job (§4.6 common skeleton): the
/// repository for load/update, the protocol adapter, the secret vault,
/// the job queue to enqueue the next phase, and configuration.
///
/// One `PhaseContext` is shared by every worker in the process; it holds
/// no per-migration state itself.
pub struct PhaseContext<R: MigrationRepository> {
    pub repository: Arc<R>,
    pub client: Arc<PdsClient>,
    pub vault: Arc<SecretVault>,
    pub queue: Arc<JobQueue>,
    pub config: Arc<Config>,
}

impl<R: MigrationRepository> Clone for PhaseContext<R> {
    fn clone(&self) -> Self {
        Self {
            repository: self.repository.clone(),
            client: self.client.clone(),
            vault: self.vault.clone(),
            queue: self.queue.clone(),
            config: self.config.clone(),
        }
    }
}

impl<R: MigrationRepository> PhaseContext<R> {
    pub fn new(
        repository: Arc<R>,
        client: Arc<PdsClient>,
        vault: Arc<SecretVault>,
        queue: Arc<JobQueue>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            repository,
            client,
            vault,
            queue,
            config,
        }
    }
}
