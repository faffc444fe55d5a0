//! Local tunnel artifacts: the cloudflared ingress file and the credential blob

use std::path::{Path, PathBuf};

use base64::Engine;
use serde::Serialize;

use crate::persist;
use crate::validation::is_valid_tunnel_id;

const CATCH_ALL_SERVICE: &str = "http_status:404";
const INGRESS_FILE_MODE: u32 = 0o644;

/// One hostname -> service mapping, or the hostname-less catch-all
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngressRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub service: String,
}

impl IngressRule {
    /// `[hostname -> service, catch-all 404]`
    pub fn single_host(hostname: &str, service: &str) -> Vec<IngressRule> {
        vec![
            IngressRule {
                hostname: Some(hostname.to_string()),
                service: service.to_string(),
            },
            IngressRule {
                hostname: None,
                service: CATCH_ALL_SERVICE.to_string(),
            },
        ]
    }
}

/// `<type>://localhost:<port>`
pub fn service_url(service_type: &str, local_port: &str) -> String {
    format!("{}://localhost:{}", service_type, local_port)
}

/// Render the cloudflared config file
pub fn render_ingress(tunnel_id: &str, credentials_file: &Path, rules: &[IngressRule]) -> String {
    let mut out = format!(
        "tunnel: {}\ncredentials-file: {}\nloglevel: info\ningress:\n",
        tunnel_id,
        credentials_file.display()
    );
    for rule in rules {
        match &rule.hostname {
            Some(hostname) => {
                out.push_str(&format!("  - hostname: {}\n", hostname));
                out.push_str(&format!("    service: {}\n", rule.service));
            }
            None => out.push_str(&format!("  - service: {}\n", rule.service)),
        }
    }
    out
}

/// Decode a tunnel token into the credential blob bytes
pub fn decode_token(token: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let engine = base64::engine::general_purpose::STANDARD;
    engine.decode(token.trim()).or_else(|_| {
        base64::engine::general_purpose::STANDARD_NO_PAD.decode(token.trim().trim_end_matches('='))
    })
}

/// Where the credential blobs and ingress files live
#[derive(Debug, Clone)]
pub struct TunnelFiles {
    creds_dir: PathBuf,
    yml_dir: PathBuf,
}

impl TunnelFiles {
    pub fn new(creds_dir: impl Into<PathBuf>, yml_dir: impl Into<PathBuf>) -> Self {
        Self {
            creds_dir: creds_dir.into(),
            yml_dir: yml_dir.into(),
        }
    }

    pub fn credentials_path(&self, tunnel_id: &str) -> PathBuf {
        self.creds_dir.join(format!("{}.json", tunnel_id))
    }

    pub fn ingress_path(&self, domain: &str) -> PathBuf {
        self.yml_dir.join(format!("{}.yml", domain))
    }

    /// Decode `token` and store it as `<creds>/<tunnel_id>.json` (0600)
    pub fn write_credentials(&self, tunnel_id: &str, token: &str) -> std::io::Result<PathBuf> {
        if !is_valid_tunnel_id(tunnel_id) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid tunnel id {:?}", tunnel_id),
            ));
        }
        let blob = decode_token(token)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let path = self.credentials_path(tunnel_id);
        persist::write_atomic(&path, &blob, 0o600)?;
        Ok(path)
    }

    /// Current ingress file of `domain`, if any
    pub fn read_ingress(&self, domain: &str) -> Option<Vec<u8>> {
        std::fs::read(self.ingress_path(domain)).ok()
    }

    /// Put back an ingress file captured with `read_ingress`
    pub fn restore_ingress(&self, domain: &str, content: &[u8]) -> std::io::Result<()> {
        persist::write_atomic(&self.ingress_path(domain), content, INGRESS_FILE_MODE)
    }

    pub fn write_ingress(
        &self,
        domain: &str,
        tunnel_id: &str,
        credentials_file: &Path,
        rules: &[IngressRule],
    ) -> std::io::Result<PathBuf> {
        let path = self.ingress_path(domain);
        let content = render_ingress(tunnel_id, credentials_file, rules);
        persist::write_atomic(&path, content.as_bytes(), INGRESS_FILE_MODE)?;
        Ok(path)
    }

    /// Best-effort removal of both artifacts for a tunnel
    pub fn remove(&self, domain: &str, tunnel_id: Option<&str>) {
        if let Err(e) = persist::remove_if_exists(&self.ingress_path(domain)) {
            tracing::warn!("Failed to remove ingress file for {}: {}", domain, e);
        }
        if let Some(tunnel_id) = tunnel_id {
            self.remove_credentials(tunnel_id);
        }
    }

    pub fn remove_credentials(&self, tunnel_id: &str) {
        if !is_valid_tunnel_id(tunnel_id) {
            tracing::warn!("Not removing credentials for invalid tunnel id {:?}", tunnel_id);
            return;
        }
        if let Err(e) = persist::remove_if_exists(&self.credentials_path(tunnel_id)) {
            tracing::warn!("Failed to remove credentials for tunnel {}: {}", tunnel_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TUNNEL_ID: &str = "c1744f8b-faa1-48a4-9e5c-02ac921467fa";
    const OTHER_TUNNEL_ID: &str = "5d0f1a62-0b3e-4c4e-9a51-7a1d2a0c9e11";

    #[test]
    fn test_render_ingress() {
        let rules = IngressRule::single_host(
            "app.example.com",
            &service_url("http", "8080"),
        );
        let rendered = render_ingress(
            "c1744f8b-faa1-48a4-9e5c-02ac921467fa",
            Path::new("/etc/burrow/creds/c1744f8b-faa1-48a4-9e5c-02ac921467fa.json"),
            &rules,
        );

        assert_eq!(
            rendered,
            "tunnel: c1744f8b-faa1-48a4-9e5c-02ac921467fa\n\
             credentials-file: /etc/burrow/creds/c1744f8b-faa1-48a4-9e5c-02ac921467fa.json\n\
             loglevel: info\n\
             ingress:\n  \
             - hostname: app.example.com\n    \
             service: http://localhost:8080\n  \
             - service: http_status:404\n"
        );
    }

    #[test]
    fn test_rules_serialize_for_api() {
        let rules = IngressRule::single_host("app.example.com", "tcp://localhost:22");
        let json = serde_json::to_value(&rules).unwrap();
        assert_eq!(
            json,
            serde_json::json!([
                { "hostname": "app.example.com", "service": "tcp://localhost:22" },
                { "service": "http_status:404" }
            ])
        );
    }

    #[test]
    fn test_decode_token() {
        // {"a":"acct","t":"tid","s":"secret"}
        let token = base64::engine::general_purpose::STANDARD
            .encode(r#"{"a":"acct","t":"tid","s":"secret"}"#);
        let blob = decode_token(&token).unwrap();
        assert_eq!(blob, br#"{"a":"acct","t":"tid","s":"secret"}"#);

        assert!(decode_token("not base64!!").is_err());
    }

    #[test]
    fn test_write_and_remove_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let files = TunnelFiles::new(dir.path().join("creds"), dir.path().join("yml"));
        let token = base64::engine::general_purpose::STANDARD.encode("blob-bytes");

        let cred_path = files.write_credentials(TUNNEL_ID, &token).unwrap();
        assert_eq!(std::fs::read(&cred_path).unwrap(), b"blob-bytes");

        let rules = IngressRule::single_host("app.example.com", "http://localhost:80");
        let yml = files
            .write_ingress("app.example.com", TUNNEL_ID, &cred_path, &rules)
            .unwrap();
        assert!(std::fs::read_to_string(&yml)
            .unwrap()
            .contains("hostname: app.example.com"));

        files.remove("app.example.com", Some(TUNNEL_ID));
        assert!(!cred_path.exists());
        assert!(!yml.exists());
    }

    #[test]
    fn test_tunnel_id_cannot_escape_creds_dir() {
        let dir = tempfile::tempdir().unwrap();
        let files = TunnelFiles::new(dir.path().join("creds"), dir.path().join("yml"));
        std::fs::write(dir.path().join("users.json"), "{}").unwrap();
        let token = base64::engine::general_purpose::STANDARD.encode("blob-bytes");

        let err = files.write_credentials("../users", &token).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
        files.remove_credentials("../users");

        assert_eq!(std::fs::read_to_string(dir.path().join("users.json")).unwrap(), "{}");
        assert!(!dir.path().join("creds").exists());
    }

    #[test]
    fn test_restore_ingress() {
        let dir = tempfile::tempdir().unwrap();
        let files = TunnelFiles::new(dir.path().join("creds"), dir.path().join("yml"));
        assert!(files.read_ingress("app.example.com").is_none());

        let rules = IngressRule::single_host("app.example.com", "http://localhost:80");
        let cred_path = files.credentials_path(TUNNEL_ID);
        files
            .write_ingress("app.example.com", TUNNEL_ID, &cred_path, &rules)
            .unwrap();
        let saved = files.read_ingress("app.example.com").unwrap();

        files
            .write_ingress("app.example.com", OTHER_TUNNEL_ID, &cred_path, &rules)
            .unwrap();
        files.restore_ingress("app.example.com", &saved).unwrap();
        assert_eq!(files.read_ingress("app.example.com").unwrap(), saved);
    }
}
