use serde_json::json;
use tracing::{info, instrument, warn};

use super::errors::{error_from_response, ClientError};
use super::types::{PlcRecommendedOperation, PlcSignedOperation, SimpleResult};

/// Triggers the source PDS to email the user a one-time directory-operation
/// token (§4.3 `request_plc_token`, §6.2). The system never sees the token
/// via this call — it arrives later through form submission.
#[instrument(skip(http_client), err)]
pub async fn request_plc_token(
    http_client: &reqwest::Client,
    pds_url: &str,
    access_jwt: &str,
) -> Result<SimpleResult, ClientError> {
    let url = format!("{pds_url}/xrpc/com.atproto.identity.requestPlcOperationSignature");
    let response = http_client
        .post(&url)
        .bearer_auth(access_jwt)
        .send()
        .await
        .map_err(|e| ClientError::NetworkError {
            message: format!("requestPlcOperationSignature request failed: {e}"),
        })?;

    if !response.status().is_success() {
        return Err(error_from_response(response, "requestPlcOperationSignature").await);
    }
    info!("directory one-time token requested");
    Ok(SimpleResult::ok())
}

/// Retrieves the unsigned recommended directory operation from the target
/// (§4.3 `get_recommended_directory_op`).
#[instrument(skip(http_client), err)]
pub async fn get_recommended_directory_op(
    http_client: &reqwest::Client,
    pds_url: &str,
    access_jwt: &str,
) -> Result<PlcRecommendedOperation, ClientError> {
    let url = format!("{pds_url}/xrpc/com.atproto.identity.getRecommendedDidCredentials");
    let response = http_client
        .get(&url)
        .bearer_auth(access_jwt)
        .send()
        .await
        .map_err(|e| ClientError::NetworkError {
            message: format!("getRecommendedDidCredentials request failed: {e}"),
        })?;

    if !response.status().is_success() {
        return Err(error_from_response(response, "getRecommendedDidCredentials").await);
    }

    let unsigned_op = response.json().await.map_err(|e| ClientError::NetworkError {
        message: format!("failed to parse getRecommendedDidCredentials response: {e}"),
    })?;
    Ok(PlcRecommendedOperation { unsigned_op })
}

/// Signs the recommended op on the source using the user-supplied one-time
/// token (§4.3 `sign_directory_op`). An invalid/expired token surfaces as
/// `Protocol`.
#[instrument(skip(http_client, one_time_token, unsigned_op), err)]
pub async fn sign_directory_op(
    http_client: &reqwest::Client,
    pds_url: &str,
    access_jwt: &str,
    unsigned_op: &serde_json::Value,
    one_time_token: &str,
) -> Result<PlcSignedOperation, ClientError> {
    let url = format!("{pds_url}/xrpc/com.atproto.identity.signPlcOperation");
    let body = json!({
        "token": one_time_token,
        "rotationKeys": unsigned_op["rotationKeys"],
        "alsoKnownAs": unsigned_op["alsoKnownAs"],
        "verificationMethods": unsigned_op["verificationMethods"],
        "services": unsigned_op["services"],
    });

    let response = http_client
        .post(&url)
        .bearer_auth(access_jwt)
        .json(&body)
        .send()
        .await
        .map_err(|e| ClientError::NetworkError {
            message: format!("signPlcOperation request failed: {e}"),
        })?;

    if !response.status().is_success() {
        return Err(error_from_response(response, "signPlcOperation").await);
    }

    let data: serde_json::Value = response.json().await.map_err(|e| ClientError::NetworkError {
        message: format!("failed to parse signPlcOperation response: {e}"),
    })?;
    Ok(PlcSignedOperation {
        signed_op: data["operation"].clone(),
    })
}

/// Submits the signed op to the target — **the point of no return**
/// (§4.3, §4.6, glossary).
#[instrument(skip(http_client, signed_op), err)]
pub async fn submit_directory_op(
    http_client: &reqwest::Client,
    pds_url: &str,
    access_jwt: &str,
    signed_op: &serde_json::Value,
) -> Result<SimpleResult, ClientError> {
    let url = format!("{pds_url}/xrpc/com.atproto.identity.submitPlcOperation");
    let body = json!({ "operation": signed_op });

    let response = http_client
        .post(&url)
        .bearer_auth(access_jwt)
        .json(&body)
        .send()
        .await
        .map_err(|e| ClientError::NetworkError {
            message: format!("submitPlcOperation request failed: {e}"),
        })?;

    if !response.status().is_success() {
        warn!("directory submission failed");
        return Err(error_from_response(response, "submitPlcOperation").await);
    }
    info!("directory operation submitted");
    Ok(SimpleResult::ok())
}

#[instrument(skip(http_client), err)]
pub async fn activate_account(
    http_client: &reqwest::Client,
    pds_url: &str,
    access_jwt: &str,
) -> Result<SimpleResult, ClientError> {
    let url = format!("{pds_url}/xrpc/com.atproto.server.activateAccount");
    let response = http_client
        .post(&url)
        .bearer_auth(access_jwt)
        .send()
        .await
        .map_err(|e| ClientError::NetworkError {
            message: format!("activateAccount request failed: {e}"),
        })?;

    if !response.status().is_success() {
        return Err(error_from_response(response, "activateAccount").await);
    }
    Ok(SimpleResult::ok())
}

/// Best-effort at the protocol-adapter level; the caller (orchestrator
/// phase) decides whether to treat failure as non-fatal (§4.6, §7).
#[instrument(skip(http_client), err)]
pub async fn deactivate_account(
    http_client: &reqwest::Client,
    pds_url: &str,
    access_jwt: &str,
) -> Result<SimpleResult, ClientError> {
    let url = format!("{pds_url}/xrpc/com.atproto.server.deactivateAccount");
    let response = http_client
        .post(&url)
        .bearer_auth(access_jwt)
        .send()
        .await
        .map_err(|e| ClientError::NetworkError {
            message: format!("deactivateAccount request failed: {e}"),
        })?;

    if !response.status().is_success() {
        return Err(error_from_response(response, "deactivateAccount").await);
    }
    Ok(SimpleResult::ok())
}

/// Registers the generated rotation key on the target's identity record
/// (§4.3 `add_rotation_key`); best-effort (§4.6).
#[instrument(skip(http_client, public_key_did_key), err)]
pub async fn add_rotation_key(
    http_client: &reqwest::Client,
    pds_url: &str,
    access_jwt: &str,
    public_key_did_key: &str,
) -> Result<SimpleResult, ClientError> {
    let recommended = get_recommended_directory_op(http_client, pds_url, access_jwt).await?;
    let mut rotation_keys: Vec<String> = recommended.unsigned_op["rotationKeys"]
        .as_array()
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();
    rotation_keys.push(public_key_did_key.to_string());

    let url = format!("{pds_url}/xrpc/com.atproto.identity.updateIdentity");
    let body = json!({ "rotationKeys": rotation_keys });
    let response = http_client
        .post(&url)
        .bearer_auth(access_jwt)
        .json(&body)
        .send()
        .await
        .map_err(|e| ClientError::NetworkError {
            message: format!("updateIdentity request failed: {e}"),
        })?;

    if !response.status().is_success() {
        return Err(error_from_response(response, "updateIdentity").await);
    }
    Ok(SimpleResult::ok())
}
