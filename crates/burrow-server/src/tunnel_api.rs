//! Tunnel control-plane abstraction
//!
//! The console talks to Cloudflare through this trait so tests can swap in a
//! recording fake. Every call takes the caller's API token: the console never
//! stores account-level credentials.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::ingress::IngressRule;

/// A DNS zone visible to the token
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
}

/// Result of creating a named tunnel
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedTunnel {
    pub id: String,
    /// Base64 tunnel token for `cloudflared tunnel run --token`
    pub token: String,
}

/// Errors from tunnel API operations
#[derive(Debug, Error)]
pub enum TunnelApiError {
    #[error("HTTP request failed: {0}")]
    Request(String),

    /// The API answered with `success: false`
    #[error("API error: {message}")]
    Api { message: String, errors: Value },

    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait TunnelApi: Send + Sync {
    /// List zones the token can see
    async fn list_zones(&self, token: &str) -> Result<Vec<Zone>, TunnelApiError>;

    /// Look up a zone's domain name by id
    async fn zone_name(&self, token: &str, zone_id: &str) -> Result<String, TunnelApiError>;

    /// Create a named tunnel in `account_id`
    async fn create_tunnel(
        &self,
        token: &str,
        account_id: &str,
        name: &str,
    ) -> Result<CreatedTunnel, TunnelApiError>;

    /// Replace the tunnel's remotely managed ingress configuration
    async fn put_ingress(
        &self,
        token: &str,
        account_id: &str,
        tunnel_id: &str,
        rules: &[IngressRule],
    ) -> Result<(), TunnelApiError>;

    /// Create a proxied CNAME `name -> target` in `zone_id`
    async fn create_cname(
        &self,
        token: &str,
        zone_id: &str,
        name: &str,
        target: &str,
    ) -> Result<(), TunnelApiError>;
}

/// CNAME target for a tunnel id
pub fn tunnel_cname_target(tunnel_id: &str) -> String {
    format!("{}.cfargotunnel.com", tunnel_id)
}
