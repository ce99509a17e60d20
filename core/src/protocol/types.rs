use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCredentials {
    pub did: String,
    pub handle: String,
    pub pds: String,
    pub access_jwt: String,
    pub refresh_jwt: String,
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResult {
    pub success: bool,
    pub message: String,
    pub did: Option<String>,
    pub session: Option<SessionCredentials>,
}

impl LoginResult {
    pub fn success(session: SessionCredentials) -> Self {
        Self {
            success: true,
            message: "Login successful".to_string(),
            did: Some(session.did.clone()),
            session: Some(session),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            did: None,
            session: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountExistsStatus {
    pub exists: bool,
    #[serde(default)]
    pub deactivated: bool,
    #[serde(default)]
    pub handle: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAccountResult {
    pub success: bool,
    pub message: String,
    pub session: Option<SessionCredentials>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobDescriptor {
    pub cid: String,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListBlobsPage {
    pub cids: Vec<BlobDescriptor>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DownloadedBlob {
    pub cid: String,
    pub local_path: std::path::PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlcRecommendedOperation {
    pub unsigned_op: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlcSignedOperation {
    pub signed_op: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAuthToken {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleResult {
    pub success: bool,
    pub message: String,
}

impl SimpleResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: "ok".to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}
