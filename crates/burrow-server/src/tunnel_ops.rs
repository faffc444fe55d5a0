//! Tunnel and proxy node operations behind the `/api/*` routes
//!
//! Register and delete are the only paths that create or remove a domain's
//! record, ingress file and credential blob, and both run under the domain's
//! lock so the three stay in step.

use std::path::Path;

use chrono::Utc;
use serde_json::{json, Value};

use crate::console::{str_field, Body, Console};
use crate::domain_store::DomainRecord;
use crate::error::{ConsoleError, Result};
use crate::ingress::{service_url, IngressRule};
use crate::launcher::{self, tunnel_key, LaunchSpec, PROXY_KEY, TEMP_TUNNEL_KEY};
use crate::share_link::{NodeProtocol, ProxyNode};
use crate::tunnel_api::{tunnel_cname_target, TunnelApiError};
use crate::validation::{
    is_valid_domain, is_valid_service_type, is_valid_subdomain, is_valid_tunnel_id,
    is_valid_ws_path, parse_port, require_domain,
};

const DEFAULT_LOCAL_PORT: u16 = 8080;
const DEFAULT_NODE_DOMAIN: &str = "localhost";
const DEFAULT_WS_PATH: &str = "/ws";
const QUICK_TUNNEL_SUFFIX: &str = ".trycloudflare.com";

/// First `https://<label>.trycloudflare.com` URL in cloudflared output
pub fn extract_quick_tunnel_url(output: &str) -> Option<&str> {
    const SCHEME: &str = "https://";

    let mut offset = 0;
    while let Some(found) = output[offset..].find(SCHEME) {
        let start = offset + found;
        let host = &output[start + SCHEME.len()..];
        let label_len = host
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-'))
            .unwrap_or(host.len());

        if label_len > 0 && host[label_len..].starts_with(QUICK_TUNNEL_SUFFIX) {
            let end = start + SCHEME.len() + label_len + QUICK_TUNNEL_SUFFIX.len();
            return Some(&output[start..end]);
        }
        offset = start + SCHEME.len();
    }
    None
}

fn port_field(body: &Body, key: &str, default: u16) -> Result<u16> {
    match body.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(default),
        Some(value) => parse_port(value),
    }
}

impl Console {
    fn tunnel_spec(&self, domain: &str, token: &str) -> LaunchSpec {
        LaunchSpec::new(
            &self.config.tunnel_bin,
            self.config.logs_dir().join(format!("{}.log", domain)),
        )
        .args(["tunnel", "run", "--token", token])
    }

    fn require_tunnel_bin(&self, message: String) -> Result<()> {
        if launcher::binary_available(&self.config.tunnel_bin) {
            Ok(())
        } else {
            Err(ConsoleError::MissingBinary(message))
        }
    }

    /// Start a quick tunnel to a local port and wait for its public URL
    pub(crate) async fn temp_tunnel(&self, body: &Body) -> Result<Value> {
        let port = port_field(body, "port", DEFAULT_LOCAL_PORT)?;
        self.require_tunnel_bin(format!(
            "cloudflared not found at {}",
            self.config.tunnel_bin.display()
        ))?;

        let log_path = self.config.logs_dir().join("temp.log");
        let origin = format!("http://localhost:{}", port);
        let spec = LaunchSpec::new(&self.config.tunnel_bin, &log_path)
            .args(["tunnel", "--url", origin.as_str()])
            .truncate_log();
        let pid = self
            .launcher
            .start(TEMP_TUNNEL_KEY, spec)
            .await
            .map_err(|e| ConsoleError::Internal(e.to_string()))?;

        let domain = self.probe_quick_tunnel(&log_path).await;
        match &domain {
            Some(url) => tracing::info!("Quick tunnel for port {} is up at {}", port, url),
            None => tracing::warn!("No quick tunnel URL for port {} yet", port),
        }

        Ok(json!({ "ok": true, "domain": domain, "pid": pid }))
    }

    /// Poll the quick tunnel log for its URL. Dropping the future stops polling.
    async fn probe_quick_tunnel(&self, log_path: &Path) -> Option<String> {
        let attempts = self.config.probe_attempts;
        let interval = self.config.probe_interval;

        let poll = async {
            for _ in 0..attempts {
                tokio::time::sleep(interval).await;
                let Ok(bytes) = tokio::fs::read(log_path).await else {
                    continue;
                };
                if let Some(url) = extract_quick_tunnel_url(&String::from_utf8_lossy(&bytes)) {
                    return Some(url.to_string());
                }
            }
            None
        };

        let deadline = interval * attempts.saturating_add(1);
        tokio::time::timeout(deadline, poll).await.ok().flatten()
    }

    pub(crate) async fn zones(&self, body: &Body) -> Result<Value> {
        let token =
            str_field(body, "token").ok_or_else(|| ConsoleError::validation("token required"))?;

        let zones = self
            .api
            .list_zones(token)
            .await
            .map_err(|e| ConsoleError::upstream("zone listing", e))?;

        Ok(json!({ "ok": true, "zones": zones }))
    }

    /// Create a named tunnel for a hostname, write its local artifacts and run it
    pub(crate) async fn register(&self, body: &Body) -> Result<Value> {
        let token = str_field(body, "token");
        let account_id = str_field(body, "account_id");
        let domain = str_field(body, "domain");
        let zone_id = str_field(body, "zone_id");
        let local_port = body
            .get("local_port")
            .filter(|v| !v.is_null() && v.as_str().map_or(true, |s| !s.trim().is_empty()));

        let (Some(token), Some(account_id), Some(local_port)) = (token, account_id, local_port)
        else {
            return Err(ConsoleError::validation("missing required fields"));
        };
        if domain.is_none() && zone_id.is_none() {
            return Err(ConsoleError::validation("missing required fields"));
        }

        if let Some(domain) = domain {
            if !is_valid_domain(domain) {
                return Err(ConsoleError::validation("invalid domain name"));
            }
        }
        let subdomain = str_field(body, "subdomain");
        if let Some(subdomain) = subdomain {
            if !is_valid_subdomain(subdomain) {
                return Err(ConsoleError::validation("invalid subdomain"));
            }
        }
        let service_type = str_field(body, "type").unwrap_or("http").to_ascii_lowercase();
        if !is_valid_service_type(&service_type) {
            return Err(ConsoleError::validation("invalid service type"));
        }
        let port = parse_port(local_port)?;

        let base_domain = match (domain, zone_id) {
            (Some(domain), _) => domain.to_string(),
            (None, Some(zone_id)) => {
                let name = self
                    .api
                    .zone_name(token, zone_id)
                    .await
                    .map_err(|e| ConsoleError::upstream("zone lookup", e))?;
                if !is_valid_domain(&name) {
                    return Err(ConsoleError::validation("invalid domain name"));
                }
                name
            }
            (None, None) => return Err(ConsoleError::validation("missing required fields")),
        };

        let full_domain = match subdomain {
            Some(subdomain) => format!("{}.{}", subdomain, base_domain),
            None => base_domain,
        };
        if !is_valid_domain(&full_domain) {
            return Err(ConsoleError::validation("invalid domain name"));
        }

        let _guard = self.domains.lock(&full_domain).await;

        let previous = match self.domains.get(&full_domain) {
            Ok(previous) => previous,
            Err(e) => {
                tracing::warn!("Replacing unreadable record for {}: {}", full_domain, e);
                None
            }
        };

        let tunnel_name = format!("burrow-{}", Utc::now().timestamp());
        let tunnel = self
            .api
            .create_tunnel(token, account_id, &tunnel_name)
            .await
            .map_err(|e| ConsoleError::upstream("tunnel creation", e))?;
        if !is_valid_tunnel_id(&tunnel.id) {
            return Err(ConsoleError::upstream(
                "tunnel creation",
                TunnelApiError::InvalidResponse(format!("unexpected tunnel id {:?}", tunnel.id)),
            ));
        }

        let credentials_file = self
            .files
            .write_credentials(&tunnel.id, &tunnel.token)
            .map_err(|e| {
                tracing::warn!(
                    "Tunnel {} was created remotely but has no local credentials",
                    tunnel.id
                );
                ConsoleError::Internal(format!("failed to save credentials: {}", e))
            })?;

        let service = service_url(&service_type, &port.to_string());
        let rules = IngressRule::single_host(&full_domain, &service);
        let prior_ingress = self.files.read_ingress(&full_domain);
        let yml_path = match self
            .files
            .write_ingress(&full_domain, &tunnel.id, &credentials_file, &rules)
        {
            Ok(path) => path,
            Err(e) => {
                self.files.remove_credentials(&tunnel.id);
                return Err(ConsoleError::Internal(format!(
                    "failed to write ingress file: {}",
                    e
                )));
            }
        };

        if let Err(e) = self
            .api
            .put_ingress(token, account_id, &tunnel.id, &rules)
            .await
        {
            tracing::warn!("Ingress push for tunnel {} failed: {}", tunnel.id, e);
        }

        if let Some(zone_id) = zone_id {
            let target = tunnel_cname_target(&tunnel.id);
            if let Err(e) = self
                .api
                .create_cname(token, zone_id, &full_domain, &target)
                .await
            {
                tracing::warn!("CNAME {} -> {} failed: {}", full_domain, target, e);
            }
        }

        let record = DomainRecord {
            api_token: tunnel.token.clone(),
            domain: full_domain.clone(),
            local_port: port.to_string(),
            yml_path: yml_path.display().to_string(),
            tunnel_id: Some(tunnel.id.clone()),
            account_id: Some(account_id.to_string()),
            service: Some(service),
            created: Some(Utc::now().timestamp_millis() as f64 / 1000.0),
        };
        if let Err(e) = self.domains.save(&record) {
            self.files.remove_credentials(&tunnel.id);
            self.restore_prior_ingress(&full_domain, prior_ingress.as_deref());
            return Err(e);
        }

        // The previous tunnel stays on Cloudflare; only its local blob goes
        if let Some(old_id) = previous
            .and_then(|p| p.tunnel_id)
            .filter(|old_id| *old_id != tunnel.id)
        {
            tracing::warn!(
                "{} moved from tunnel {} to {}; the old tunnel is left on Cloudflare",
                full_domain,
                old_id,
                tunnel.id
            );
            self.files.remove_credentials(&old_id);
        }

        tracing::info!("Registered {} on tunnel {}", full_domain, tunnel.id);

        let key = tunnel_key(&full_domain);
        if !launcher::binary_available(&self.config.tunnel_bin) {
            self.launcher.stop(&key).await;
            return Ok(json!({
                "ok": true,
                "domain": full_domain,
                "note": "created but cloudflared is not available to run it",
            }));
        }

        match self
            .launcher
            .start(&key, self.tunnel_spec(&full_domain, &tunnel.token))
            .await
        {
            Ok(pid) => Ok(json!({ "ok": true, "domain": full_domain, "pid": pid })),
            Err(e) => {
                tracing::warn!("Registered {} but failed to run it: {}", full_domain, e);
                Ok(json!({
                    "ok": true,
                    "domain": full_domain,
                    "note": format!("created but failed to run: {}", e),
                }))
            }
        }
    }

    /// Put the domain's ingress file back the way it was before a failed register
    fn restore_prior_ingress(&self, domain: &str, prior: Option<&[u8]>) {
        match prior {
            Some(content) => {
                if let Err(e) = self.files.restore_ingress(domain, content) {
                    tracing::warn!("Failed to restore ingress file for {}: {}", domain, e);
                }
            }
            None => self.files.remove(domain, None),
        }
    }

    /// Every stored record plus whether its tunnel process is alive
    pub(crate) async fn list(&self) -> Value {
        let mut items = Vec::new();
        for record in self.domains.list() {
            let process = self.launcher.info(&tunnel_key(&record.domain)).await;
            let mut item = serde_json::to_value(&record).unwrap_or_else(|_| json!({}));
            item["running"] = Value::Bool(process.is_some());
            if let Some(process) = process {
                item["pid"] = json!(process.pid);
                item["started_at"] = json!(process.started_at.to_rfc3339());
                item["log"] = json!(process.log_path.display().to_string());
            }
            items.push(item);
        }
        json!({ "ok": true, "items": items })
    }

    /// Stop the domain's tunnel and remove its record, ingress file and credentials
    pub(crate) async fn delete(&self, body: &Body) -> Result<Value> {
        let domain = require_domain(str_field(body, "domain"))?;
        let _guard = self.domains.lock(domain).await;

        let tunnel_id = match self.domains.get(domain) {
            Ok(Some(record)) => record.tunnel_id,
            Ok(None) => return Err(ConsoleError::NotFound("domain not found".to_string())),
            Err(e) => {
                tracing::warn!("Deleting unreadable record for {}: {}", domain, e);
                None
            }
        };

        self.launcher.stop(&tunnel_key(domain)).await;
        self.files.remove(domain, tunnel_id.as_deref());
        self.domains.remove(domain)?;

        tracing::info!("Deleted {}", domain);
        Ok(json!({ "ok": true, "message": format!("{} deleted", domain) }))
    }

    /// (Re)start the tunnel process of a registered domain
    pub(crate) async fn run(&self, body: &Body) -> Result<Value> {
        let domain = require_domain(str_field(body, "domain"))?;
        let _guard = self.domains.lock(domain).await;

        let record = self
            .domains
            .get(domain)?
            .ok_or_else(|| ConsoleError::NotFound("config not found".to_string()))?;
        self.require_tunnel_bin("cloudflared not available".to_string())?;

        let pid = self
            .launcher
            .start(
                &tunnel_key(domain),
                self.tunnel_spec(domain, &record.api_token),
            )
            .await
            .map_err(|e| ConsoleError::Internal(e.to_string()))?;

        Ok(json!({ "ok": true, "pid": pid }))
    }

    pub(crate) async fn stop(&self, body: &Body) -> Result<Value> {
        let domain = require_domain(str_field(body, "domain"))?;
        let _guard = self.domains.lock(domain).await;

        if self.domains.get(domain)?.is_none() {
            return Err(ConsoleError::NotFound("domain not found".to_string()));
        }
        let stopped = self.launcher.stop(&tunnel_key(domain)).await;

        Ok(json!({ "ok": true, "stopped": stopped }))
    }

    /// Write the xray config, (re)start xray and return the share link
    pub(crate) async fn start_node(&self, body: &Body) -> Result<Value> {
        let protocol = NodeProtocol::from_label(str_field(body, "type").unwrap_or("VMess"));

        let domain = match str_field(body, "domain") {
            Some(domain) if is_valid_domain(domain) => domain.to_string(),
            Some(_) => return Err(ConsoleError::validation("invalid domain")),
            None => DEFAULT_NODE_DOMAIN.to_string(),
        };
        let local_port = port_field(body, "port", DEFAULT_LOCAL_PORT)?;
        let uuid = match str_field(body, "uuid") {
            Some(raw) => uuid::Uuid::parse_str(raw)
                .map_err(|_| ConsoleError::validation("invalid uuid"))?
                .to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        let path = str_field(body, "path").unwrap_or(DEFAULT_WS_PATH).to_string();
        if !is_valid_ws_path(&path) {
            return Err(ConsoleError::validation("invalid path"));
        }

        if !launcher::binary_available(&self.config.proxy_bin) {
            return Err(ConsoleError::MissingBinary(
                "xray binary not found".to_string(),
            ));
        }

        let node = ProxyNode {
            protocol,
            domain,
            local_port,
            uuid,
            path,
        };

        let config_path = self.config.xray_dir().join("config.json");
        crate::persist::write_json_atomic(&config_path, &node.xray_config(), 0o600)?;

        let spec = LaunchSpec::new(
            &self.config.proxy_bin,
            self.config.logs_dir().join("xray.log"),
        )
        .args(["run", "-c"])
        .args([config_path.display().to_string()]);
        let pid = self
            .launcher
            .start(PROXY_KEY, spec)
            .await
            .map_err(|e| ConsoleError::Internal(e.to_string()))?;

        tracing::info!(
            "{} node on 127.0.0.1:{} for {}",
            node.protocol.as_str(),
            node.local_port,
            node.domain
        );
        Ok(json!({ "ok": true, "pid": pid, "link": node.share_link() }))
    }

    pub(crate) async fn stop_node(&self) -> Value {
        let stopped = self.launcher.stop(PROXY_KEY).await;
        json!({ "ok": true, "stopped": stopped })
    }
}
