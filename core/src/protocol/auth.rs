use serde_json::json;
use tracing::{info, instrument, warn};

use super::errors::{error_from_response, ClientError};
use super::types::{LoginResult, SessionCredentials};

/// Core `com.atproto.server.createSession` call shared by every login path
/// (§4.3 "Password-based" token acquisition strategy).
#[instrument(skip(http_client, password, auth_factor_token), err)]
pub async fn create_session_core(
    http_client: &reqwest::Client,
    identifier: &str,
    password: &str,
    pds_url: &str,
    auth_factor_token: Option<&str>,
) -> Result<LoginResult, ClientError> {
    let url = format!("{pds_url}/xrpc/com.atproto.server.createSession");

    let mut body = json!({
        "identifier": identifier,
        "password": password,
    });
    if let Some(token) = auth_factor_token {
        body["authFactorToken"] = json!(token);
    }

    let response = http_client
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(|e| ClientError::NetworkError {
            message: format!("createSession request failed: {e}"),
        })?;

    if !response.status().is_success() {
        let status = response.status();
        let err = error_from_response(response, "createSession").await;
        if let ClientError::ATProtocolError { error, .. } = &err {
            if error == "AuthFactorTokenRequired" {
                info!("two-factor authentication required for {identifier}");
                return Ok(LoginResult::error("Two-factor authentication required"));
            }
        }
        warn!(%status, "createSession failed for {identifier}");
        return Ok(LoginResult::error(err.to_string()));
    }

    let data: serde_json::Value = response.json().await.map_err(|e| ClientError::NetworkError {
        message: format!("failed to parse createSession response: {e}"),
    })?;

    let is_active = data["active"].as_bool().unwrap_or(true);
    let status = data["status"].as_str();
    if !is_active {
        return Ok(LoginResult::error(format!(
            "account is not active (status: {})",
            status.unwrap_or("unknown")
        )));
    }

    let access_jwt = data["accessJwt"].as_str().unwrap_or_default().to_string();
    let refresh_jwt = data["refreshJwt"].as_str().unwrap_or_default().to_string();
    if access_jwt.is_empty() || refresh_jwt.is_empty() {
        return Ok(LoginResult::error(
            "login succeeded but no session tokens were returned",
        ));
    }

    let session = SessionCredentials {
        did: data["did"].as_str().unwrap_or_default().to_string(),
        handle: data["handle"].as_str().unwrap_or(identifier).to_string(),
        pds: pds_url.to_string(),
        expires_at: jwt_expiration(&access_jwt),
        access_jwt,
        refresh_jwt,
    };

    info!(did = %session.did, "login successful");
    Ok(LoginResult::success(session))
}

/// Rotates tokens via `com.atproto.server.refreshSession`, using the
/// refresh JWT as the bearer (§4.3 "Refresh-token-based" strategy).
#[instrument(skip(http_client, refresh_jwt), err)]
pub async fn refresh_session(
    http_client: &reqwest::Client,
    pds_url: &str,
    refresh_jwt: &str,
) -> Result<SessionCredentials, ClientError> {
    let url = format!("{pds_url}/xrpc/com.atproto.server.refreshSession");
    let response = http_client
        .post(&url)
        .bearer_auth(refresh_jwt)
        .send()
        .await
        .map_err(|e| ClientError::NetworkError {
            message: format!("refreshSession request failed: {e}"),
        })?;

    if !response.status().is_success() {
        let err = error_from_response(response, "refreshSession").await;
        return Err(ClientError::AuthenticationFailed {
            message: err.to_string(),
        });
    }

    let data: serde_json::Value = response.json().await.map_err(|e| ClientError::NetworkError {
        message: format!("failed to parse refreshSession response: {e}"),
    })?;

    let access_jwt = data["accessJwt"].as_str().unwrap_or_default().to_string();
    let new_refresh_jwt = data["refreshJwt"].as_str().unwrap_or_default().to_string();
    if access_jwt.is_empty() || new_refresh_jwt.is_empty() {
        return Err(ClientError::AuthenticationFailed {
            message: "refreshSession returned no tokens".to_string(),
        });
    }

    Ok(SessionCredentials {
        did: data["did"].as_str().unwrap_or_default().to_string(),
        handle: data["handle"].as_str().unwrap_or_default().to_string(),
        pds: pds_url.to_string(),
        expires_at: jwt_expiration(&access_jwt),
        access_jwt,
        refresh_jwt: new_refresh_jwt,
    })
}

#[instrument(skip(http_client, service_auth_token), err)]
pub async fn get_service_auth(
    http_client: &reqwest::Client,
    pds_url: &str,
    access_jwt: &str,
    aud: &str,
    lxm: &str,
) -> Result<String, ClientError> {
    let url = format!(
        "{pds_url}/xrpc/com.atproto.server.getServiceAuth?aud={aud}&lxm={lxm}"
    );
    let response = http_client
        .get(&url)
        .bearer_auth(access_jwt)
        .send()
        .await
        .map_err(|e| ClientError::NetworkError {
            message: format!("getServiceAuth request failed: {e}"),
        })?;

    if !response.status().is_success() {
        return Err(error_from_response(response, "getServiceAuth").await);
    }

    let data: serde_json::Value = response.json().await.map_err(|e| ClientError::NetworkError {
        message: format!("failed to parse getServiceAuth response: {e}"),
    })?;

    let token = data["token"].as_str().unwrap_or_default().to_string();
    if token.is_empty() {
        return Err(ClientError::PdsOperationFailed {
            operation: "getServiceAuth".to_string(),
            message: "empty service-auth token".to_string(),
        });
    }
    Ok(token)
}

/// Decodes a JWT payload (no signature verification, matching the pack's
/// session-expiry convention) and extracts `exp` as unix seconds.
pub fn jwt_expiration(jwt: &str) -> Option<i64> {
    let payload = jwt.split('.').nth(1)?;
    let decoded = base64::Engine::decode(
        &base64::engine::general_purpose::URL_SAFE_NO_PAD,
        payload,
    )
    .ok()?;
    let value: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    value["exp"].as_i64()
}
