use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use crate::identity::{IdentityResolver, WebIdentityResolver};

use super::account;
use super::auth;
use super::blobs;
use super::errors::ClientError;
use super::plc;
use super::preferences;
use super::repo;
use super::types::*;

/// Default per-request timeout for control calls (§5): 30s.
const CONTROL_CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Blob transfer call ceiling (§5): 300s.
const BLOB_CALL_TIMEOUT: Duration = Duration::from_secs(300);
/// Repo import/export ceiling (§5): 600s.
const REPO_CALL_TIMEOUT: Duration = Duration::from_secs(600);

/// Wire-level client for both PDS endpoints and the identity directory
/// (§4.3 Protocol Adapter). One instance is created per phase job.
pub struct PdsClient {
    control_http: reqwest::Client,
    blob_http: reqwest::Client,
    repo_http: reqwest::Client,
    identity_resolver: Arc<dyn IdentityResolver>,
}

impl PdsClient {
    pub fn new() -> Result<Self, ClientError> {
        let build = |timeout: Duration| {
            reqwest::Client::builder()
                .user_agent("atproto-migration-orchestrator/1.0")
                .connect_timeout(Duration::from_secs(30))
                .timeout(timeout)
                .build()
                .map_err(|e| ClientError::NetworkError {
                    message: format!("failed to build http client: {e}"),
                })
        };
        let control_http = build(CONTROL_CALL_TIMEOUT)?;
        Ok(Self {
            identity_resolver: Arc::new(WebIdentityResolver::new(control_http.clone())),
            control_http,
            blob_http: build(BLOB_CALL_TIMEOUT)?,
            repo_http: build(REPO_CALL_TIMEOUT)?,
        })
    }

    /// Resolves a handle/DID to its PDS endpoint via `describeRepo` against
    /// known hosts, falling back to standard two-level-domain heuristics for
    /// well-known providers (§4.3 `resolve_pds_from_did`).
    #[instrument(skip(self), err)]
    pub async fn resolve_pds_from_did(&self, did: &str) -> Result<String, ClientError> {
        if let Some(method_specific) = did.strip_prefix("did:web:") {
            return Ok(format!("https://{}", method_specific.replace("%3A", ":")));
        }
        if did.starts_with("did:plc:") {
            let directory_url = format!("https://plc.directory/{did}");
            let response = self.control_http.get(&directory_url).send().await.map_err(|e| {
                ClientError::NetworkError {
                    message: format!("plc.directory lookup failed: {e}"),
                }
            })?;
            if !response.status().is_success() {
                return Err(super::errors::error_from_response(response, "plc.directory").await);
            }
            let doc: serde_json::Value =
                response.json().await.map_err(|e| ClientError::NetworkError {
                    message: format!("failed to parse DID document: {e}"),
                })?;
            let service_endpoint = doc["service"]
                .as_array()
                .and_then(|services| {
                    services
                        .iter()
                        .find(|s| s["id"].as_str() == Some("#atproto_pds"))
                })
                .and_then(|s| s["serviceEndpoint"].as_str());
            return service_endpoint.map(String::from).ok_or_else(|| {
                ClientError::PdsOperationFailed {
                    operation: "resolve_pds_from_did".to_string(),
                    message: "no #atproto_pds service endpoint in DID document".to_string(),
                }
            });
        }
        Err(ClientError::PdsOperationFailed {
            operation: "resolve_pds_from_did".to_string(),
            message: format!("unsupported DID method: {did}"),
        })
    }

    /// Heuristic host derivation for a handle when no PDS is yet known
    /// (new-account creation before the DID exists anywhere).
    pub fn derive_pds_url_from_handle(&self, handle: &str) -> String {
        if handle.ends_with(".bsky.social") {
            return "https://bsky.social".to_string();
        }
        let labels: Vec<&str> = handle.split('.').collect();
        if labels.len() >= 2 {
            let apex = labels[labels.len() - 2..].join(".");
            return format!("https://{apex}");
        }
        format!("https://{handle}")
    }

    #[instrument(skip(self, password), err)]
    pub async fn login(&self, identifier: &str, password: &str) -> Result<LoginResult, ClientError> {
        let pds_url = if identifier.starts_with("did:") {
            self.resolve_pds_from_did(identifier).await?
        } else {
            let did = self
                .identity_resolver
                .resolve_handle(identifier)
                .await
                .map_err(ClientError::ResolutionFailed)?;
            self.resolve_pds_from_did(&did).await?
        };
        auth::create_session_core(&self.control_http, identifier, password, &pds_url, None).await
    }

    #[instrument(skip(self, password), err)]
    pub async fn try_login_at(
        &self,
        handle: &str,
        password: &str,
        pds_url: &str,
    ) -> Result<LoginResult, ClientError> {
        auth::create_session_core(&self.control_http, handle, password, pds_url, None).await
    }

    #[instrument(skip(self, refresh_jwt), err)]
    pub async fn refresh_session(
        &self,
        pds_url: &str,
        refresh_jwt: &str,
    ) -> Result<SessionCredentials, ClientError> {
        auth::refresh_session(&self.control_http, pds_url, refresh_jwt).await
    }

    #[instrument(skip(self), err)]
    pub async fn describe_server(&self, pds_url: &str) -> Result<serde_json::Value, ClientError> {
        account::describe_server(&self.control_http, pds_url).await
    }

    #[instrument(skip(self), err)]
    pub async fn get_service_auth(
        &self,
        pds_url: &str,
        access_jwt: &str,
        aud_service_did: &str,
    ) -> Result<String, ClientError> {
        auth::get_service_auth(
            &self.control_http,
            pds_url,
            access_jwt,
            aud_service_did,
            "com.atproto.server.createAccount",
        )
        .await
    }

    #[instrument(skip(self), err)]
    pub async fn check_account_exists_on_target(
        &self,
        pds_url: &str,
        did: &str,
    ) -> Result<AccountExistsStatus, ClientError> {
        account::check_account_exists_on_target(&self.control_http, pds_url, did).await
    }

    #[instrument(skip(self, password, service_auth_token), err)]
    #[allow(clippy::too_many_arguments)]
    pub async fn create_account_on_target(
        &self,
        pds_url: &str,
        did: &str,
        handle: &str,
        email: &str,
        password: &str,
        invite_code: Option<&str>,
        service_auth_token: &str,
    ) -> Result<CreateAccountResult, ClientError> {
        account::create_account_on_target(
            &self.control_http,
            pds_url,
            did,
            handle,
            email,
            password,
            invite_code,
            service_auth_token,
        )
        .await
    }

    #[instrument(skip(self, access_jwt), err)]
    pub async fn export_repo(
        &self,
        pds_url: &str,
        did: &str,
        access_jwt: &str,
        dest_path: &Path,
    ) -> Result<u64, ClientError> {
        repo::export_repository(&self.repo_http, pds_url, did, access_jwt, dest_path).await
    }

    #[instrument(skip(self, access_jwt), err)]
    pub async fn import_repo(
        &self,
        pds_url: &str,
        access_jwt: &str,
        car_path: &Path,
    ) -> Result<(), ClientError> {
        repo::import_repository(&self.repo_http, pds_url, access_jwt, car_path).await
    }

    #[instrument(skip(self), err)]
    pub async fn list_blobs(
        &self,
        pds_url: &str,
        did: &str,
        cursor: Option<&str>,
    ) -> Result<ListBlobsPage, ClientError> {
        blobs::list_blobs(&self.control_http, pds_url, did, cursor).await
    }

    /// Enumerates every blob by following cursors to exhaustion (§4.3
    /// "pagination terminates when the returned cursor is empty/absent").
    pub async fn list_all_blobs(
        &self,
        pds_url: &str,
        did: &str,
    ) -> Result<Vec<BlobDescriptor>, ClientError> {
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.list_blobs(pds_url, did, cursor.as_deref()).await?;
            all.extend(page.cids);
            match page.cursor {
                Some(c) if !c.is_empty() => cursor = Some(c),
                _ => break,
            }
        }
        Ok(all)
    }

    #[instrument(skip(self), err)]
    pub async fn download_blob(
        &self,
        pds_url: &str,
        did: &str,
        cid: &str,
        dest_path: &Path,
    ) -> Result<u64, ClientError> {
        blobs::download_blob(&self.blob_http, pds_url, did, cid, dest_path).await
    }

    #[instrument(skip(self, access_jwt), err)]
    pub async fn upload_blob(
        &self,
        pds_url: &str,
        access_jwt: &str,
        local_path: &Path,
    ) -> Result<(), ClientError> {
        blobs::upload_blob(&self.blob_http, pds_url, access_jwt, local_path).await
    }

    #[instrument(skip(self, access_jwt), err)]
    pub async fn get_missing_blobs(
        &self,
        pds_url: &str,
        access_jwt: &str,
    ) -> Result<Vec<String>, ClientError> {
        blobs::get_missing_blobs(&self.control_http, pds_url, access_jwt).await
    }

    #[instrument(skip(self, access_jwt), err)]
    pub async fn export_preferences(
        &self,
        pds_url: &str,
        access_jwt: &str,
    ) -> Result<serde_json::Value, ClientError> {
        preferences::export_preferences(&self.control_http, pds_url, access_jwt).await
    }

    #[instrument(skip(self, access_jwt, preferences), err)]
    pub async fn import_preferences(
        &self,
        pds_url: &str,
        access_jwt: &str,
        preferences: &serde_json::Value,
    ) -> Result<(), ClientError> {
        super::preferences::import_preferences(&self.control_http, pds_url, access_jwt, preferences)
            .await
    }

    #[instrument(skip(self, access_jwt), err)]
    pub async fn request_plc_token(&self, pds_url: &str, access_jwt: &str) -> Result<SimpleResult, ClientError> {
        plc::request_plc_token(&self.control_http, pds_url, access_jwt).await
    }

    #[instrument(skip(self, access_jwt), err)]
    pub async fn get_recommended_directory_op(
        &self,
        pds_url: &str,
        access_jwt: &str,
    ) -> Result<PlcRecommendedOperation, ClientError> {
        plc::get_recommended_directory_op(&self.control_http, pds_url, access_jwt).await
    }

    #[instrument(skip(self, access_jwt, unsigned_op, one_time_token), err)]
    pub async fn sign_directory_op(
        &self,
        pds_url: &str,
        access_jwt: &str,
        unsigned_op: &serde_json::Value,
        one_time_token: &str,
    ) -> Result<PlcSignedOperation, ClientError> {
        plc::sign_directory_op(&self.control_http, pds_url, access_jwt, unsigned_op, one_time_token).await
    }

    #[instrument(skip(self, access_jwt, signed_op), err)]
    pub async fn submit_directory_op(
        &self,
        pds_url: &str,
        access_jwt: &str,
        signed_op: &serde_json::Value,
    ) -> Result<SimpleResult, ClientError> {
        plc::submit_directory_op(&self.control_http, pds_url, access_jwt, signed_op).await
    }

    #[instrument(skip(self, access_jwt), err)]
    pub async fn activate_account(&self, pds_url: &str, access_jwt: &str) -> Result<SimpleResult, ClientError> {
        plc::activate_account(&self.control_http, pds_url, access_jwt).await
    }

    #[instrument(skip(self, access_jwt), err)]
    pub async fn deactivate_account(&self, pds_url: &str, access_jwt: &str) -> Result<SimpleResult, ClientError> {
        plc::deactivate_account(&self.control_http, pds_url, access_jwt).await
    }

    #[instrument(skip(self, access_jwt, public_key_did_key), err)]
    pub async fn add_rotation_key(
        &self,
        pds_url: &str,
        access_jwt: &str,
        public_key_did_key: &str,
    ) -> Result<SimpleResult, ClientError> {
        plc::add_rotation_key(&self.control_http, pds_url, access_jwt, public_key_did_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn derive_pds_url_from_handle_known_providers() {
        let client = PdsClient::new().unwrap();
        assert_eq!(
            client.derive_pds_url_from_handle("alice.bsky.social"),
            "https://bsky.social"
        );
        assert_eq!(
            client.derive_pds_url_from_handle("alice.example.com"),
            "https://example.com"
        );
    }

    #[tokio::test]
    async fn resolve_pds_from_did_web() {
        let client = PdsClient::new().unwrap();
        let pds = client.resolve_pds_from_did("did:web:pds.example.com").await.unwrap();
        assert_eq!(pds, "https://pds.example.com");
    }
}
