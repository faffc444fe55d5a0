//! Burrow console library
//!
//! Provisions Cloudflare named tunnels through the Cloudflare API, runs them
//! with `cloudflared`, and supervises a local `xray` node, all behind a
//! single-user web console. Exposed as a library for the binary and for
//! end-to-end tests.

mod cloudflare;
mod config;
mod console;
mod credentials;
mod domain_store;
mod error;
mod http_surface;
mod ingress;
mod launcher;
mod persist;
mod rate_limit;
mod session;
mod share_link;
mod tunnel_api;
mod tunnel_ops;
mod validation;

#[cfg(test)]
mod test_support;

// Re-export public types
pub use cloudflare::CloudflareClient;
pub use config::{ConsoleConfig, RateLimits, ResolvedConfig, ResolvedTls};
pub use console::{ApiRequest, ApiResponse, Console};
pub use credentials::{CredentialError, CredentialStore, InitOutcome, DEFAULT_ADMIN};
pub use domain_store::{DomainRecord, DomainStore};
pub use error::ConsoleError;
pub use http_surface::HttpSurface;
pub use ingress::{IngressRule, TunnelFiles};
pub use launcher::{binary_available, tunnel_key, LaunchError, LaunchSpec, ProcessInfo, ProcessLauncher};
pub use session::SESSION_COOKIE;
pub use share_link::{NodeProtocol, ProxyNode};
pub use tunnel_api::{CreatedTunnel, TunnelApi, TunnelApiError, Zone};
pub use tunnel_ops::extract_quick_tunnel_url;
