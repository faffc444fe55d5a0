//! xray inbound config and the `vmess://` / `vless://` share links for it
//!
//! The node listens on 127.0.0.1 behind a Cloudflare tunnel, so links always
//! point at port 443 of the public domain with TLS and a WebSocket transport.

use base64::Engine;
use serde::Serialize;
use serde_json::{json, Value};

const EDGE_PORT: u16 = 443;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeProtocol {
    Vmess,
    Vless,
}

impl NodeProtocol {
    /// Anything starting with "vmess" (any case) is VMess, everything else VLESS
    pub fn from_label(label: &str) -> Self {
        if label.to_ascii_lowercase().starts_with("vmess") {
            NodeProtocol::Vmess
        } else {
            NodeProtocol::Vless
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeProtocol::Vmess => "vmess",
            NodeProtocol::Vless => "vless",
        }
    }
}

/// Parameters of the local proxy node
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyNode {
    pub protocol: NodeProtocol,
    /// Public domain the tunnel serves; links use it as address, SNI and host
    pub domain: String,
    pub local_port: u16,
    pub uuid: String,
    pub path: String,
}

/// VMess link descriptor, field order as clients expect it
#[derive(Debug, Serialize)]
struct VmessDescriptor<'a> {
    v: &'a str,
    ps: String,
    add: &'a str,
    port: String,
    id: &'a str,
    aid: &'a str,
    net: &'a str,
    #[serde(rename = "type")]
    header_type: &'a str,
    path: &'a str,
    tls: &'a str,
    sni: &'a str,
    host: &'a str,
}

impl ProxyNode {
    fn label(&self) -> String {
        format!("CF-{}", self.domain)
    }

    /// Connection URI for this node
    pub fn share_link(&self) -> String {
        match self.protocol {
            NodeProtocol::Vmess => {
                let descriptor = VmessDescriptor {
                    v: "2",
                    ps: self.label(),
                    add: &self.domain,
                    port: EDGE_PORT.to_string(),
                    id: &self.uuid,
                    aid: "0",
                    net: "ws",
                    header_type: "none",
                    path: &self.path,
                    tls: "tls",
                    sni: &self.domain,
                    host: &self.domain,
                };
                // Serializing a struct of strings cannot fail
                let json = serde_json::to_string(&descriptor).unwrap_or_default();
                format!(
                    "vmess://{}",
                    base64::engine::general_purpose::STANDARD.encode(json)
                )
            }
            NodeProtocol::Vless => format!(
                "vless://{id}@{d}:{port}?encryption=none&type=ws&security=tls&host={d}&sni={d}&path={path}#{label}",
                id = self.uuid,
                d = self.domain,
                port = EDGE_PORT,
                path = self.path,
                label = self.label(),
            ),
        }
    }

    /// xray config with one WebSocket inbound on 127.0.0.1 and a direct outbound
    pub fn xray_config(&self) -> Value {
        let settings = match self.protocol {
            NodeProtocol::Vmess => json!({ "clients": [{ "id": self.uuid }] }),
            NodeProtocol::Vless => json!({
                "clients": [{ "id": self.uuid }],
                "decryption": "none"
            }),
        };

        json!({
            "inbounds": [{
                "port": self.local_port,
                "listen": "127.0.0.1",
                "protocol": self.protocol.as_str(),
                "settings": settings,
                "streamSettings": {
                    "network": "ws",
                    "wsSettings": { "path": self.path }
                }
            }],
            "outbounds": [{ "protocol": "freedom" }]
        })
    }
}
