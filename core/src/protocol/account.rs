use serde_json::json;
use tracing::{info, instrument, warn};

use super::errors::{error_from_response, ClientError};
use super::types::{AccountExistsStatus, CreateAccountResult, SessionCredentials};

/// `com.atproto.server.describeServer` — used to derive the service DID
/// for `getServiceAuth`'s `aud` parameter and to confirm reachability.
#[instrument(skip(http_client), err)]
pub async fn describe_server(
    http_client: &reqwest::Client,
    pds_url: &str,
) -> Result<serde_json::Value, ClientError> {
    let url = format!("{pds_url}/xrpc/com.atproto.server.describeServer");
    let response = http_client
        .get(&url)
        .send()
        .await
        .map_err(|e| ClientError::NetworkError {
            message: format!("describeServer request failed: {e}"),
        })?;
    if !response.status().is_success() {
        return Err(error_from_response(response, "describeServer").await);
    }
    response.json().await.map_err(|e| ClientError::NetworkError {
        message: format!("failed to parse describeServer response: {e}"),
    })
}

/// Best-effort existence check (§4.3: "never fatal; unknown -> {exists:false}").
#[instrument(skip(http_client), err)]
pub async fn check_account_exists_on_target(
    http_client: &reqwest::Client,
    pds_url: &str,
    did: &str,
) -> Result<AccountExistsStatus, ClientError> {
    let url = format!("{pds_url}/xrpc/com.atproto.admin.getAccountInfo?did={did}");
    let response = match http_client.get(&url).send().await {
        Ok(r) => r,
        Err(_) => return Ok(AccountExistsStatus { exists: false, deactivated: false, handle: None }),
    };

    if response.status().as_u16() == 404 {
        return Ok(AccountExistsStatus {
            exists: false,
            deactivated: false,
            handle: None,
        });
    }
    if !response.status().is_success() {
        return Ok(AccountExistsStatus {
            exists: false,
            deactivated: false,
            handle: None,
        });
    }

    let data: serde_json::Value = match response.json().await {
        Ok(v) => v,
        Err(_) => {
            return Ok(AccountExistsStatus {
                exists: false,
                deactivated: false,
                handle: None,
            })
        }
    };

    Ok(AccountExistsStatus {
        exists: true,
        deactivated: data["deactivatedAt"].is_string(),
        handle: data["handle"].as_str().map(String::from),
    })
}

/// `com.atproto.server.createAccount` (§4.3, §4.6 create-account phase).
/// Detects `AlreadyExists` and whether the error response smuggles back
/// session tokens usable for resumption.
#[instrument(skip(http_client, password, service_auth_token), err)]
pub async fn create_account_on_target(
    http_client: &reqwest::Client,
    pds_url: &str,
    did: &str,
    handle: &str,
    email: &str,
    password: &str,
    invite_code: Option<&str>,
    service_auth_token: &str,
) -> Result<CreateAccountResult, ClientError> {
    let url = format!("{pds_url}/xrpc/com.atproto.server.createAccount");

    let mut body = json!({
        "did": did,
        "handle": handle,
        "email": email,
        "password": password,
    });
    if let Some(code) = invite_code {
        body["inviteCode"] = json!(code);
    }

    let response = http_client
        .post(&url)
        .bearer_auth(service_auth_token)
        .json(&body)
        .send()
        .await
        .map_err(|e| ClientError::NetworkError {
            message: format!("createAccount request failed: {e}"),
        })?;

    if response.status().is_success() {
        let data: serde_json::Value =
            response.json().await.map_err(|e| ClientError::NetworkError {
                message: format!("failed to parse createAccount response: {e}"),
            })?;
        let access_jwt = data["accessJwt"].as_str().unwrap_or_default().to_string();
        let refresh_jwt = data["refreshJwt"].as_str().unwrap_or_default().to_string();
        let session = if !access_jwt.is_empty() && !refresh_jwt.is_empty() {
            Some(SessionCredentials {
                did: did.to_string(),
                handle: handle.to_string(),
                pds: pds_url.to_string(),
                expires_at: super::auth::jwt_expiration(&access_jwt),
                access_jwt,
                refresh_jwt,
            })
        } else {
            None
        };
        info!(did, "account created on target");
        return Ok(CreateAccountResult {
            success: true,
            message: "account created".to_string(),
            session,
        });
    }

    let status = response.status();
    let body_text = response.text().await.unwrap_or_default();
    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&body_text) {
        if parsed["error"].as_str() == Some("AlreadyExists") {
            warn!(did, "createAccount: account already exists on target");
            return Ok(CreateAccountResult {
                success: false,
                message: "AlreadyExists".to_string(),
                session: None,
            });
        }
    }

    Err(ClientError::PdsOperationFailed {
        operation: "createAccount".to_string(),
        message: format!("status {status}: {body_text}"),
    })
}
