pub mod migration;
pub mod validation;

pub use migration::{FailureTag, Migration, MigrationStatus, MigrationType, ProgressData};
