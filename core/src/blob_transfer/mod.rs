pub mod concurrent;
pub mod progress;
pub mod streamed;

pub use concurrent::ConcurrentBlobMigration;
pub use progress::ProgressTracker;
pub use streamed::StreamedBlobMigration;
