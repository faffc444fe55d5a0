//! In-crate fakes for console tests

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use hyper::header::SET_COOKIE;
use hyper::Method;
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;

use crate::config::ResolvedConfig;
use crate::console::{ApiRequest, Console};
use crate::ingress::IngressRule;
use crate::tunnel_api::{CreatedTunnel, TunnelApi, TunnelApiError, Zone};

pub const ADMIN_PASSWORD: &str = "correct horse";

#[derive(Default)]
struct Recorded {
    calls: Mutex<Vec<String>>,
    tunnels: AtomicUsize,
    failing: bool,
    /// Hand out this id instead of a well-formed one
    tunnel_id_override: Option<String>,
}

/// Tunnel API fake that records every call
#[derive(Clone, Default)]
pub struct RecordingApi {
    inner: Arc<Recorded>,
}

impl RecordingApi {
    /// Every call answers `success: false`
    pub fn failing() -> Self {
        Self {
            inner: Arc::new(Recorded {
                failing: true,
                ..Recorded::default()
            }),
        }
    }

    /// Tunnel creation answers with `id` verbatim
    pub fn with_tunnel_id(id: &str) -> Self {
        Self {
            inner: Arc::new(Recorded {
                tunnel_id_override: Some(id.to_string()),
                ..Recorded::default()
            }),
        }
    }

    /// Id of the n-th created tunnel
    pub fn tunnel_id(&self, n: usize) -> String {
        format!("00000000-0000-4000-8000-{:012}", n)
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.calls.lock().clone()
    }

    /// Token handed out with the n-th created tunnel
    pub fn tunnel_token(&self, n: usize) -> String {
        base64::engine::general_purpose::STANDARD.encode(format!(
            r#"{{"a":"acct-1","t":"{}","s":"c2VjcmV0"}}"#,
            self.tunnel_id(n)
        ))
    }

    fn record(&self, call: String) -> Result<(), TunnelApiError> {
        self.inner.calls.lock().push(call);
        if self.inner.failing {
            return Err(TunnelApiError::Api {
                message: "Authentication error".to_string(),
                errors: json!([{ "code": 10000, "message": "Authentication error" }]),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TunnelApi for RecordingApi {
    async fn list_zones(&self, _token: &str) -> Result<Vec<Zone>, TunnelApiError> {
        self.record("list_zones".to_string())?;
        Ok(vec![Zone {
            id: "zone-1".to_string(),
            name: "example.com".to_string(),
        }])
    }

    async fn zone_name(&self, _token: &str, zone_id: &str) -> Result<String, TunnelApiError> {
        self.record(format!("zone_name {}", zone_id))?;
        Ok(format!("{}.example", zone_id))
    }

    async fn create_tunnel(
        &self,
        _token: &str,
        account_id: &str,
        _name: &str,
    ) -> Result<CreatedTunnel, TunnelApiError> {
        self.record(format!("create_tunnel {}", account_id))?;
        let n = self.inner.tunnels.fetch_add(1, Ordering::SeqCst) + 1;
        let id = match &self.inner.tunnel_id_override {
            Some(id) => id.clone(),
            None => self.tunnel_id(n),
        };
        Ok(CreatedTunnel {
            id,
            token: self.tunnel_token(n),
        })
    }

    async fn put_ingress(
        &self,
        _token: &str,
        account_id: &str,
        tunnel_id: &str,
        _rules: &[IngressRule],
    ) -> Result<(), TunnelApiError> {
        self.record(format!("put_ingress {} {}", account_id, tunnel_id))
    }

    async fn create_cname(
        &self,
        _token: &str,
        zone_id: &str,
        name: &str,
        target: &str,
    ) -> Result<(), TunnelApiError> {
        self.record(format!("create_cname {} {} -> {}", zone_id, name, target))
    }
}

/// Console rooted in a fresh temp dir, admin password `ADMIN_PASSWORD`
pub fn console(api: RecordingApi) -> (TempDir, Arc<Console>) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ResolvedConfig::with_main_dir(dir.path());
    config.admin_password = Some(ADMIN_PASSWORD.to_string());
    config.probe_attempts = 3;
    config.probe_interval = Duration::from_millis(50);

    let console = Console::new(config, Arc::new(api)).unwrap();
    (dir, console)
}

/// Log in as admin and return the session id
pub async fn login(console: &Console) -> String {
    let response = console
        .handle(
            ApiRequest::new(Method::POST, "/login", IpAddr::from([127, 0, 0, 1]))
                .with_json(&json!({ "username": "admin", "password": ADMIN_PASSWORD })),
        )
        .await;

    let cookie = response.header(&SET_COOKIE).unwrap();
    cookie
        .split(';')
        .next()
        .and_then(|pair| pair.split_once('='))
        .map(|(_, value)| value.to_string())
        .unwrap()
}
