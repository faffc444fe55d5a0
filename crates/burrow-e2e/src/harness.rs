//! Test console harness for E2E tests
//!
//! Starts a complete console on an ephemeral port with a temporary main
//! directory, a mock Cloudflare API and fake tunnel/proxy binaries.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use burrow_server::{Console, HttpSurface, RateLimits, ResolvedConfig};

use crate::certificates::TestCertificates;
use crate::fake_bins::FakeBinaries;
use crate::mock_cloudflare::MockCloudflare;

pub const ADMIN_PASSWORD: &str = "e2e-admin-password";

/// How to start a test console
#[derive(Clone)]
pub struct TestOptions {
    /// Serve over HTTPS with generated certificates
    pub tls: bool,
    /// Point the console at the fake cloudflared and xray
    pub binaries: bool,
    pub rate_limits: RateLimits,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            tls: false,
            binaries: true,
            rate_limits: RateLimits {
                default_per_hour: 1000,
                default_per_day: 1000,
                ..RateLimits::default()
            },
        }
    }
}

/// A running console instance
pub struct TestConsole {
    pub addr: SocketAddr,
    /// `http://addr` or `https://localhost:port`
    pub base_url: String,
    pub cloudflare: MockCloudflare,
    pub console: Arc<Console>,
    pub certs: Option<TestCertificates>,
    main_dir: TempDir,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestConsole {
    pub async fn start() -> Self {
        Self::start_with(TestOptions::default()).await
    }

    pub async fn start_with(options: TestOptions) -> Self {
        let binaries = FakeBinaries::get();
        let cloudflare = MockCloudflare::start().await;
        let main_dir = tempfile::tempdir().expect("Failed to create main dir");

        let mut config = ResolvedConfig::with_main_dir(main_dir.path());
        config.api_base = cloudflare.api_base();
        config.api_timeout = Duration::from_secs(5);
        config.admin_password = Some(ADMIN_PASSWORD.to_string());
        config.probe_attempts = 30;
        config.probe_interval = Duration::from_millis(100);
        config.rate_limits = options.rate_limits;
        if options.binaries {
            config.tunnel_bin = binaries.cloudflared.clone();
            config.proxy_bin = binaries.xray.clone();
        }

        let certs = options.tls.then(TestCertificates::generate);
        let tls_acceptor = certs.as_ref().map(|certs| {
            let _ = rustls::crypto::ring::default_provider().install_default();
            config.secure_cookies = true;
            burrow_common::tls_acceptor_from_pem(&certs.server_cert_pem, &certs.server_key_pem)
                .expect("Failed to load console TLS config")
        });

        let console = Console::with_cloudflare(config).expect("Failed to build console");
        let surface = HttpSurface::new(console.clone(), tls_acceptor);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind console");
        let addr = listener.local_addr().unwrap();
        let base_url = if certs.is_some() {
            format!("https://localhost:{}", addr.port())
        } else {
            format!("http://{}", addr)
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let console_clone = console.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = surface.run_with_listener(listener) => {
                    if let Err(e) = result {
                        tracing::error!("Console error: {}", e);
                    }
                }
                _ = shutdown_rx => {
                    tracing::debug!("Console shutting down");
                }
            }
            console_clone.shutdown().await;
        });

        Self {
            addr,
            base_url,
            cloudflare,
            console,
            certs,
            main_dir,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn main_dir(&self) -> &Path {
        self.main_dir.path()
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.main_dir.path().join(relative)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// A client with a cookie jar that does not follow redirects
    pub fn client(&self) -> reqwest::Client {
        let mut builder = reqwest::Client::builder()
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(30));
        if let Some(certs) = &self.certs {
            let ca = reqwest::Certificate::from_pem(certs.ca_cert_pem.as_bytes())
                .expect("Failed to parse test CA");
            builder = builder.add_root_certificate(ca);
        }
        builder.build().expect("Failed to build client")
    }

    /// A client logged in as admin
    pub async fn login(&self) -> reqwest::Client {
        let client = self.client();
        let (status, body) = self
            .post(
                &client,
                "/login",
                json!({ "username": "admin", "password": ADMIN_PASSWORD }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "login failed: {}", body);
        client
    }

    pub async fn post(&self, client: &reqwest::Client, path: &str, body: Value) -> (StatusCode, Value) {
        let response = client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .expect("Request failed");
        let status = response.status();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    pub async fn get(&self, client: &reqwest::Client, path: &str) -> (StatusCode, Value) {
        let response = client
            .get(self.url(path))
            .send()
            .await
            .expect("Request failed");
        let status = response.status();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    /// Poll `f` until it returns true or `timeout` passes
    pub async fn eventually<F, Fut>(timeout: Duration, mut f: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if f().await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for TestConsole {
    fn drop(&mut self) {
        self.shutdown();
    }
}
