//! Console served over HTTPS

use burrow_e2e::{TestConsole, TestOptions};
use reqwest::StatusCode;
use serde_json::json;

/// Initialize tracing and crypto provider for tests
fn init_test() {
    // Install rustls crypto provider (ignore if already installed)
    let _ = rustls::crypto::ring::default_provider().install_default();

    let _ = tracing_subscriber::fmt()
        .with_env_filter("burrow_server=debug,burrow_e2e=debug")
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_https_login_sets_secure_cookie() {
    init_test();
    let console = TestConsole::start_with(TestOptions {
        tls: true,
        ..TestOptions::default()
    })
    .await;
    assert!(console.base_url.starts_with("https://"));

    let client = console.client();
    let response = client
        .post(console.url("/login"))
        .json(&json!({ "username": "admin", "password": burrow_e2e::ADMIN_PASSWORD }))
        .send()
        .await
        .expect("HTTPS request failed");
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response.headers()["set-cookie"].to_str().unwrap().to_string();
    assert!(cookie.contains("; Secure"));

    let (status, body) = console.get(&client, "/api/check").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
}

#[tokio::test]
async fn test_plain_http_is_refused_on_tls_port() {
    init_test();
    let console = TestConsole::start_with(TestOptions {
        tls: true,
        ..TestOptions::default()
    })
    .await;

    let plain = reqwest::Client::new();
    let result = plain
        .get(format!("http://{}/login", console.addr))
        .send()
        .await;
    assert!(result.is_err());
}
