use async_trait::async_trait;
use serde::Deserialize;

use crate::protocol::errors::ResolveError;

/// Heuristic check mirroring what the wire protocol itself would reject
/// early, before spending a network round trip.
pub fn should_resolve_handle(handle: &str) -> bool {
    !handle.is_empty() && handle.contains('.') && !handle.starts_with("did:")
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve_handle(&self, handle: &str) -> Result<String, ResolveError>;
}

/// Resolves `handle -> DID` via DNS-over-HTTPS TXT lookup of
/// `_atproto.<handle>`, falling back to the HTTPS well-known document
/// (§2 Identity Resolver, §4.3).
pub struct WebIdentityResolver {
    http_client: reqwest::Client,
    doh_endpoint: String,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(default)]
    #[serde(rename = "Answer")]
    answer: Option<Vec<DohAnswerRecord>>,
}

#[derive(Debug, Deserialize)]
struct DohAnswerRecord {
    data: String,
}

impl WebIdentityResolver {
    pub fn new(http_client: reqwest::Client) -> Self {
        Self {
            http_client,
            doh_endpoint: "https://cloudflare-dns.com/dns-query".to_string(),
        }
    }

    pub fn with_doh_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.doh_endpoint = endpoint.into();
        self
    }

    async fn resolve_via_dns_txt(&self, handle: &str) -> Result<String, ResolveError> {
        let name = format!("_atproto.{handle}");
        let url = format!("{}?name={}&type=TXT", self.doh_endpoint, name);

        let response = self
            .http_client
            .get(&url)
            .header("Accept", "application/dns-json")
            .send()
            .await
            .map_err(|e| ResolveError::DnsQueryFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ResolveError::DnsQueryFailed(format!(
                "DoH endpoint returned {}",
                response.status()
            )));
        }

        let parsed: DohAnswer = response
            .json()
            .await
            .map_err(|e| ResolveError::DnsQueryFailed(e.to_string()))?;

        let dids: Vec<String> = parsed
            .answer
            .unwrap_or_default()
            .into_iter()
            .filter_map(|record| {
                let unquoted = record.data.trim_matches('"');
                unquoted.strip_prefix("did=").map(String::from)
            })
            .collect();

        match dids.len() {
            0 => Err(ResolveError::NoDIDsFound(handle.to_string())),
            1 => Ok(dids.into_iter().next().unwrap()),
            _ => Err(ResolveError::MultipleDIDsFound(handle.to_string(), dids)),
        }
    }

    async fn resolve_via_well_known(&self, handle: &str) -> Result<String, ResolveError> {
        let url = format!("https://{handle}/.well-known/atproto-did");
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| ResolveError::HttpWellKnownFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ResolveError::HttpWellKnownFailed(format!(
                "well-known endpoint returned {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ResolveError::HttpWellKnownFailed(e.to_string()))?;
        let did = body.trim();
        if did.starts_with("did:") {
            Ok(did.to_string())
        } else {
            Err(ResolveError::MalformedDidDocument(format!(
                "well-known body is not a DID: {did}"
            )))
        }
    }
}

#[async_trait]
impl IdentityResolver for WebIdentityResolver {
    async fn resolve_handle(&self, handle: &str) -> Result<String, ResolveError> {
        if !should_resolve_handle(handle) {
            return Err(ResolveError::InvalidHandle(handle.to_string()));
        }

        match self.resolve_via_dns_txt(handle).await {
            Ok(did) => Ok(did),
            Err(dns_err) => self.resolve_via_well_known(handle).await.map_err(|_| dns_err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_resolve_rejects_dids_and_empty() {
        assert!(!should_resolve_handle(""));
        assert!(!should_resolve_handle("did:plc:abc"));
        assert!(should_resolve_handle("user.example.com"));
    }
}
