use std::fmt;

use crate::protocol::errors::ClientError;

/// Coarse error class used by the job runtime to select a retry policy (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Authentication,
    RateLimit,
    Network,
    Timeout,
    Protocol,
    AccountExists,
    Validation,
    FatalUnknown,
}

impl ErrorKind {
    /// `AccountExists` is the only kind the job runtime never retries.
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::AccountExists)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Authentication => "Authentication",
            ErrorKind::RateLimit => "RateLimit",
            ErrorKind::Network => "Network",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Protocol => "Protocol",
            ErrorKind::AccountExists => "AccountExists",
            ErrorKind::Validation => "Validation",
            ErrorKind::FatalUnknown => "Fatal-Unknown",
        };
        f.write_str(s)
    }
}

impl From<&ClientError> for ErrorKind {
    fn from(e: &ClientError) -> Self {
        match e {
            ClientError::AuthenticationFailed { .. } | ClientError::SessionExpired { .. } => {
                ErrorKind::Authentication
            }
            ClientError::RateLimited { .. } => ErrorKind::RateLimit,
            ClientError::NetworkError { .. } => ErrorKind::Network,
            ClientError::Timeout { .. } => ErrorKind::Timeout,
            ClientError::AccountExists { .. } => ErrorKind::AccountExists,
            ClientError::InvalidCredentials { .. }
            | ClientError::ResourceNotFound { .. }
            | ClientError::ServerError { .. }
            | ClientError::PdsOperationFailed { .. }
            | ClientError::InvalidResponse { .. }
            | ClientError::ATProtocolError { .. } => ErrorKind::Protocol,
            ClientError::ResolutionFailed(_) => ErrorKind::Network,
            ClientError::SerializationError { .. } | ClientError::ApiError { .. } => {
                ErrorKind::FatalUnknown
            }
            ClientError::StorageError { .. } => ErrorKind::FatalUnknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Orchestrator-level error taxonomy. Distinct from [`ClientError`], which
/// is the wire-level representation produced by the protocol adapter;
/// phases map a `ClientError` into one of these via [`ErrorKind`].
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("storage error: {source}")]
    Storage {
        #[source]
        source: StorageError,
        context: String,
    },

    #[error("network error (retry {retry_count}): {message}")]
    Network { message: String, retry_count: u32 },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("authentication error: {0}")]
    Authentication(String),

    #[error("migration step failed: {step}: {message}")]
    MigrationStep { step: String, message: String },

    #[error("blob processing error: {0}")]
    BlobProcessing(String),

    #[error("pds client error: {0}")]
    PdsClient(#[from] ClientError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("resume error: {0}")]
    Resume(String),

    #[error("account already exists on target: {0}")]
    AccountExists(String),

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl MigrationError {
    pub fn with_context(source: StorageError, context: impl Into<String>) -> Self {
        MigrationError::Storage {
            source,
            context: context.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrationError::Authentication(_) => ErrorKind::Authentication,
            MigrationError::Network { .. } => ErrorKind::Network,
            MigrationError::AccountExists(_) => ErrorKind::AccountExists,
            MigrationError::Validation(_) => ErrorKind::Validation,
            MigrationError::PdsClient(e) => ErrorKind::from(e),
            MigrationError::Configuration(_)
            | MigrationError::Storage { .. }
            | MigrationError::MigrationStep { .. }
            | MigrationError::BlobProcessing(_)
            | MigrationError::Resume(_)
            | MigrationError::Unknown(_) => ErrorKind::FatalUnknown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.kind() {
            ErrorKind::RateLimit | ErrorKind::Network | ErrorKind::Timeout => ErrorSeverity::Low,
            ErrorKind::Authentication | ErrorKind::Protocol => ErrorSeverity::Medium,
            ErrorKind::Validation => ErrorSeverity::High,
            ErrorKind::AccountExists | ErrorKind::FatalUnknown => ErrorSeverity::Critical,
        }
    }
}

impl From<String> for MigrationError {
    fn from(s: String) -> Self {
        MigrationError::Unknown(s)
    }
}

impl From<&str> for MigrationError {
    fn from(s: &str) -> Self {
        MigrationError::Unknown(s.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("unique constraint violated: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("retry exhausted after {attempts} attempts: {cause}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, MigrationError>;
