use tracing::instrument;

use super::errors::{error_from_response, ClientError};

/// Small JSON round-trip (§4.6 "Import Preferences").
#[instrument(skip(http_client), err)]
pub async fn export_preferences(
    http_client: &reqwest::Client,
    pds_url: &str,
    access_jwt: &str,
) -> Result<serde_json::Value, ClientError> {
    let url = format!("{pds_url}/xrpc/app.bsky.actor.getPreferences");
    let response = http_client
        .get(&url)
        .bearer_auth(access_jwt)
        .send()
        .await
        .map_err(|e| ClientError::NetworkError {
            message: format!("getPreferences request failed: {e}"),
        })?;

    if !response.status().is_success() {
        return Err(error_from_response(response, "getPreferences").await);
    }

    response.json().await.map_err(|e| ClientError::NetworkError {
        message: format!("failed to parse getPreferences response: {e}"),
    })
}

#[instrument(skip(http_client, preferences), err)]
pub async fn import_preferences(
    http_client: &reqwest::Client,
    pds_url: &str,
    access_jwt: &str,
    preferences: &serde_json::Value,
) -> Result<(), ClientError> {
    let url = format!("{pds_url}/xrpc/app.bsky.actor.putPreferences");
    let response = http_client
        .post(&url)
        .bearer_auth(access_jwt)
        .json(preferences)
        .send()
        .await
        .map_err(|e| ClientError::NetworkError {
            message: format!("putPreferences request failed: {e}"),
        })?;

    if !response.status().is_success() {
        return Err(error_from_response(response, "putPreferences").await);
    }
    Ok(())
}
