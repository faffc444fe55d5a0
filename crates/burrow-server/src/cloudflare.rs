use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::ingress::IngressRule;
use crate::tunnel_api::{CreatedTunnel, TunnelApi, TunnelApiError, Zone};
use crate::validation::is_valid_tunnel_id;

/// Cloudflare API client for tunnels, zones and DNS records
pub struct CloudflareClient {
    client: Client,
    api_base: String,
}

/// Common `{success, result, errors}` wrapper of every v4 response
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    result: Option<T>,
    #[serde(default)]
    errors: Value,
}

#[derive(Debug, Deserialize)]
struct ZoneResult {
    id: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TunnelResult {
    id: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateTunnel<'a> {
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateDnsRecord<'a> {
    #[serde(rename = "type")]
    record_type: &'a str,
    name: &'a str,
    content: &'a str,
    proxied: bool,
    ttl: u32,
}

impl From<reqwest::Error> for TunnelApiError {
    fn from(err: reqwest::Error) -> Self {
        TunnelApiError::Request(err.to_string())
    }
}

impl CloudflareClient {
    pub fn new(api_base: &str, timeout: Duration) -> Result<Self, TunnelApiError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    /// Decode an envelope and turn `success: false` into an API error
    async fn parse<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<Option<T>, TunnelApiError> {
        let envelope: Envelope<T> = response.json().await?;
        if envelope.success {
            Ok(envelope.result)
        } else {
            Err(api_error(envelope.errors))
        }
    }
}

/// Build an API error, joining the messages of the `errors` array
pub(crate) fn api_error(errors: Value) -> TunnelApiError {
    let message = errors
        .as_array()
        .map(|list| {
            list.iter()
                .filter_map(|e| e.get("message").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(", ")
        })
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| "api returned success=false".to_string());

    TunnelApiError::Api { message, errors }
}

#[async_trait]
impl TunnelApi for CloudflareClient {
    async fn list_zones(&self, token: &str) -> Result<Vec<Zone>, TunnelApiError> {
        tracing::debug!("Listing zones");

        let response = self
            .client
            .get(self.url("/zones"))
            .bearer_auth(token)
            .send()
            .await?;

        let zones: Vec<ZoneResult> = Self::parse(response).await?.unwrap_or_default();
        Ok(zones
            .into_iter()
            .map(|z| Zone {
                id: z.id.unwrap_or_default(),
                name: z.name.unwrap_or_default(),
            })
            .collect())
    }

    async fn zone_name(&self, token: &str, zone_id: &str) -> Result<String, TunnelApiError> {
        tracing::debug!("Looking up zone {}", zone_id);

        let response = self
            .client
            .get(self.url(&format!("/zones/{}", zone_id)))
            .bearer_auth(token)
            .send()
            .await?;

        Self::parse::<ZoneResult>(response)
            .await?
            .and_then(|z| z.name)
            .ok_or_else(|| TunnelApiError::InvalidResponse("zone has no name".to_string()))
    }

    async fn create_tunnel(
        &self,
        token: &str,
        account_id: &str,
        name: &str,
    ) -> Result<CreatedTunnel, TunnelApiError> {
        tracing::info!("Creating tunnel {} in account {}", name, account_id);

        let response = self
            .client
            .post(self.url(&format!("/accounts/{}/tunnels", account_id)))
            .bearer_auth(token)
            .json(&CreateTunnel { name })
            .send()
            .await?;

        let result: TunnelResult = Self::parse(response).await?.ok_or_else(|| {
            TunnelApiError::InvalidResponse("tunnel creation returned null response".to_string())
        })?;

        match (result.id, result.token) {
            (Some(id), Some(_)) if !is_valid_tunnel_id(&id) => Err(
                TunnelApiError::InvalidResponse(format!("unexpected tunnel id {:?}", id)),
            ),
            (Some(id), Some(token)) if !token.is_empty() => {
                tracing::info!("Created tunnel {} with ID {}", name, id);
                Ok(CreatedTunnel { id, token })
            }
            _ => Err(TunnelApiError::InvalidResponse(
                "no id or token in response".to_string(),
            )),
        }
    }

    async fn put_ingress(
        &self,
        token: &str,
        account_id: &str,
        tunnel_id: &str,
        rules: &[IngressRule],
    ) -> Result<(), TunnelApiError> {
        tracing::info!("Pushing ingress configuration for tunnel {}", tunnel_id);

        let response = self
            .client
            .put(self.url(&format!(
                "/accounts/{}/cfd_tunnel/{}/configurations",
                account_id, tunnel_id
            )))
            .bearer_auth(token)
            .json(&json!({ "config": { "ingress": rules } }))
            .send()
            .await?;

        Self::parse::<Value>(response).await.map(|_| ())
    }

    async fn create_cname(
        &self,
        token: &str,
        zone_id: &str,
        name: &str,
        target: &str,
    ) -> Result<(), TunnelApiError> {
        tracing::info!("Creating DNS CNAME record: {} -> {}", name, target);

        let response = self
            .client
            .post(self.url(&format!("/zones/{}/dns_records", zone_id)))
            .bearer_auth(token)
            .json(&CreateDnsRecord {
                record_type: "CNAME",
                name,
                content: target,
                proxied: true,
                ttl: 1, // automatic
            })
            .send()
            .await?;

        Self::parse::<Value>(response).await.map(|_| ())
    }
}
