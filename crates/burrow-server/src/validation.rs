//! Input checks for values that end up in file names, ingress rules or URIs

use serde_json::Value;

use crate::error::{ConsoleError, Result};

/// Service schemes accepted for an ingress rule
const SERVICE_TYPES: &[&str] = &["http", "https", "tcp", "ssh", "rdp", "smb"];

/// Domain names: `[A-Za-z0-9.-]+`, no `..`
///
/// Not a full hostname grammar; it keeps the value safe to use as a file name.
pub fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 || domain.contains("..") {
        return false;
    }
    domain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

/// Subdomain labels: `[A-Za-z0-9-]+`
pub fn is_valid_subdomain(subdomain: &str) -> bool {
    if subdomain.is_empty() || subdomain.len() > 63 {
        return false;
    }
    subdomain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// WebSocket paths for the proxy inbound: leading `/`, URI-safe characters only
pub fn is_valid_ws_path(path: &str) -> bool {
    path.starts_with('/')
        && path.len() <= 128
        && path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.' | '~'))
}

/// Tunnel ids in canonical hyphenated UUID form; they become file names and ingress lines
pub fn is_valid_tunnel_id(tunnel_id: &str) -> bool {
    uuid::Uuid::parse_str(tunnel_id)
        .is_ok_and(|id| id.hyphenated().to_string().eq_ignore_ascii_case(tunnel_id))
}

pub fn is_valid_service_type(service: &str) -> bool {
    SERVICE_TYPES.contains(&service)
}

pub fn require_domain(domain: Option<&str>) -> Result<&str> {
    match domain {
        Some(d) if is_valid_domain(d) => Ok(d),
        _ => Err(ConsoleError::validation("invalid domain")),
    }
}

/// Read a JSON value that the UI may send as either a string or a number
pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse a TCP port given as a string or number
pub fn parse_port(value: &Value) -> Result<u16> {
    value_to_string(value)
        .and_then(|s| s.parse::<u16>().ok())
        .filter(|port| *port != 0)
        .ok_or_else(|| ConsoleError::validation("invalid port"))
}
