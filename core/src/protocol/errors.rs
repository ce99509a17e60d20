use std::fmt;

/// Handle/DID resolution failures (§2 Identity Resolver).
#[derive(Debug, Clone)]
pub enum ResolveError {
    InvalidHandle(String),
    NoDIDsFound(String),
    MultipleDIDsFound(String, Vec<String>),
    DnsQueryFailed(String),
    HttpWellKnownFailed(String),
    NotADid(String),
    MalformedDidDocument(String),
    Network(String),
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveError::InvalidHandle(h) => write!(f, "invalid handle: {h}"),
            ResolveError::NoDIDsFound(h) => write!(f, "no DID found for handle {h}"),
            ResolveError::MultipleDIDsFound(h, dids) => {
                write!(f, "multiple DIDs found for handle {h}: {dids:?}")
            }
            ResolveError::DnsQueryFailed(msg) => write!(f, "DNS query failed: {msg}"),
            ResolveError::HttpWellKnownFailed(msg) => {
                write!(f, "well-known lookup failed: {msg}")
            }
            ResolveError::NotADid(s) => write!(f, "not a valid DID: {s}"),
            ResolveError::MalformedDidDocument(s) => write!(f, "malformed DID document: {s}"),
            ResolveError::Network(msg) => write!(f, "network error: {msg}"),
        }
    }
}

impl std::error::Error for ResolveError {}

/// A structured error body returned by an ATProto XRPC endpoint.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ATProtocolError {
    pub error: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RateLimitInfo {
    pub limit: Option<u64>,
    pub reset: Option<u64>,
    pub policy: Option<String>,
}

impl RateLimitInfo {
    pub fn from_headers(headers: &reqwest::header::HeaderMap) -> Self {
        let get = |name: &str| -> Option<String> {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        };
        RateLimitInfo {
            limit: get("ratelimit-limit").and_then(|s| s.parse().ok()),
            reset: get("ratelimit-reset").and_then(|s| s.parse().ok()),
            policy: get("ratelimit-policy"),
        }
    }

    pub fn retry_after_seconds(&self) -> Option<u64> {
        self.reset
    }
}

/// Wire-level error taxonomy for the protocol adapter (§4.3, §7).
#[derive(Debug)]
pub enum ClientError {
    ResolutionFailed(ResolveError),
    ATProtocolError { error: String, message: String },
    RateLimited { info: RateLimitInfo, operation: String },
    AuthenticationFailed { message: String },
    NetworkError { message: String },
    SerializationError { message: String },
    ApiError { status: u16, message: String },
    StorageError { message: String },
    InvalidCredentials { message: String },
    SessionExpired { message: String },
    ResourceNotFound { message: String },
    ServerError { status: u16, message: String },
    PdsOperationFailed { operation: String, message: String },
    InvalidResponse { message: String },
    Timeout { operation: String },
    AccountExists { orphaned_deactivated: bool, message: String },
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::ResolutionFailed(e) => write!(f, "resolution failed: {e}"),
            ClientError::ATProtocolError { error, message } => {
                write!(f, "{error}: {message}")
            }
            ClientError::RateLimited { operation, .. } => {
                write!(f, "rate limited during {operation}")
            }
            ClientError::AuthenticationFailed { message } => {
                write!(f, "authentication failed: {message}")
            }
            ClientError::NetworkError { message } => write!(f, "network error: {message}"),
            ClientError::SerializationError { message } => {
                write!(f, "serialization error: {message}")
            }
            ClientError::ApiError { status, message } => {
                write!(f, "api error ({status}): {message}")
            }
            ClientError::StorageError { message } => write!(f, "storage error: {message}"),
            ClientError::InvalidCredentials { message } => {
                write!(f, "invalid credentials: {message}")
            }
            ClientError::SessionExpired { message } => write!(f, "session expired: {message}"),
            ClientError::ResourceNotFound { message } => {
                write!(f, "resource not found: {message}")
            }
            ClientError::ServerError { status, message } => {
                write!(f, "server error ({status}): {message}")
            }
            ClientError::PdsOperationFailed { operation, message } => {
                write!(f, "{operation} failed: {message}")
            }
            ClientError::InvalidResponse { message } => {
                write!(f, "invalid response: {message}")
            }
            ClientError::Timeout { operation } => write!(f, "{operation} timed out"),
            ClientError::AccountExists {
                orphaned_deactivated,
                message,
            } => {
                if *orphaned_deactivated {
                    write!(f, "orphaned deactivated account exists: {message}")
                } else {
                    write!(f, "account already exists: {message}")
                }
            }
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ResolveError> for ClientError {
    fn from(e: ResolveError) -> Self {
        ClientError::ResolutionFailed(e)
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::SerializationError {
            message: e.to_string(),
        }
    }
}

/// Substrings that mark a body as rate-limit related even without a 429 (§4.3).
const RATE_LIMIT_MARKERS: &[&str] = &["RateLimitExceeded", "Too Many Requests", "rate limit"];

pub fn body_signals_rate_limit(body: &str) -> bool {
    RATE_LIMIT_MARKERS
        .iter()
        .any(|marker| body.contains(marker))
}

/// Classify a non-success HTTP response into a [`ClientError`] (§4.3, §7).
/// Checks rate-limit signals first (status or body), then a structured
/// ATProto error body, then falls back to status-code categorization.
pub async fn error_from_response(response: reqwest::Response, operation: &str) -> ClientError {
    let status = response.status();
    let headers = response.headers().clone();

    if status.as_u16() == 429 {
        return ClientError::RateLimited {
            info: RateLimitInfo::from_headers(&headers),
            operation: operation.to_string(),
        };
    }

    let body_text = response
        .text()
        .await
        .unwrap_or_else(|e| format!("<failed to read body: {e}>"));

    if body_signals_rate_limit(&body_text) {
        return ClientError::RateLimited {
            info: RateLimitInfo::from_headers(&headers),
            operation: operation.to_string(),
        };
    }

    if let Ok(parsed) = serde_json::from_str::<ATProtocolError>(&body_text) {
        if parsed.error == "AlreadyExists" {
            return ClientError::AccountExists {
                orphaned_deactivated: false,
                message: parsed.message.unwrap_or(body_text),
            };
        }
        return ClientError::ATProtocolError {
            error: parsed.error,
            message: parsed.message.unwrap_or_default(),
        };
    }

    match status.as_u16() {
        401 => ClientError::AuthenticationFailed { message: body_text },
        403 => ClientError::InvalidCredentials { message: body_text },
        404 => ClientError::ResourceNotFound { message: body_text },
        500..=599 => ClientError::ServerError {
            status: status.as_u16(),
            message: body_text,
        },
        _ => ClientError::PdsOperationFailed {
            operation: operation.to_string(),
            message: body_text,
        },
    }
}
