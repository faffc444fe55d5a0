//! Authentication, session and validation behaviour over HTTP

use burrow_e2e::{TestConsole, TestOptions, ADMIN_PASSWORD};
use reqwest::StatusCode;
use serde_json::json;

/// Initialize tracing for tests
fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("burrow_server=debug,burrow_e2e=debug")
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_anonymous_access_is_refused() {
    init_test();
    let console = TestConsole::start().await;
    let client = console.client();

    let (status, body) = console.get(&client, "/api/list").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, json!({ "ok": false, "error": "unauthorized" }));

    let (status, _) = console
        .post(&client, "/api/delete", json!({ "domain": "example.com" }))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let page = client.get(console.url("/")).send().await.unwrap();
    assert_eq!(page.status(), StatusCode::FOUND);
    assert_eq!(page.headers()["location"], "/login");

    // Public surface
    let login_page = client.get(console.url("/login")).send().await.unwrap();
    assert_eq!(login_page.status(), StatusCode::OK);
    assert!(login_page.text().await.unwrap().contains("login_form"));
    let script = client.get(console.url("/static/main.js")).send().await.unwrap();
    assert_eq!(script.status(), StatusCode::OK);

    assert!(console.cloudflare.calls().is_empty());
}

#[tokio::test]
async fn test_login_session_and_logout() {
    init_test();
    let console = TestConsole::start().await;
    let client = console.client();

    let response = client
        .post(console.url("/login"))
        .json(&json!({ "username": "admin", "password": ADMIN_PASSWORD }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response.headers()["set-cookie"].to_str().unwrap().to_string();
    assert!(cookie.starts_with("burrow_session="));
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("SameSite=Lax"));
    assert!(!cookie.contains("Secure"));

    let (status, body) = console.get(&client, "/api/check").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cloudflared"], true);
    assert_eq!(body["xray"], true);
    assert_eq!(body["main_dir"], console.main_dir().display().to_string());

    let index = client.get(console.url("/")).send().await.unwrap();
    assert_eq!(index.status(), StatusCode::OK);
    assert!(index.text().await.unwrap().contains(r#"data-username="admin""#));

    let (status, _) = console.post(&client, "/logout", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = console.get(&client, "/api/check").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_wrong_password_is_rejected() {
    init_test();
    let console = TestConsole::start().await;
    let client = console.client();

    let (status, body) = console
        .post(
            &client,
            "/login",
            json!({ "username": "admin", "password": "not-the-password" }),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "invalid username or password");

    let (status, _) = console
        .post(&client, "/login", json!({ "username": "root", "password": ADMIN_PASSWORD }))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_login_is_rate_limited() {
    init_test();
    let console = TestConsole::start().await;
    let client = console.client();
    let attempt = json!({ "username": "admin", "password": "guess" });

    for _ in 0..5 {
        let (status, _) = console.post(&client, "/login", attempt.clone()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    let (status, body) = console.post(&client, "/login", attempt).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "rate limit exceeded");

    // Even the right password waits for the window
    let (status, _) = console
        .post(
            &client,
            "/login",
            json!({ "username": "admin", "password": ADMIN_PASSWORD }),
        )
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_default_budget_applies_to_api_routes() {
    init_test();
    let mut options = TestOptions::default();
    options.rate_limits.default_per_hour = 3;
    let console = TestConsole::start_with(options).await;
    let client = console.login().await;

    for _ in 0..3 {
        let (status, _) = console.get(&client, "/api/list").await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, _) = console.get(&client, "/api/list").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_change_password() {
    init_test();
    let console = TestConsole::start().await;
    let client = console.login().await;
    let other = console.login().await;

    let (status, body) = console
        .post(
            &client,
            "/api/change_password",
            json!({ "old_password": ADMIN_PASSWORD, "new_password": "short" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "password must be at least 8 characters");

    let (status, body) = console
        .post(
            &client,
            "/api/change_password",
            json!({ "old_password": "wrong-old-password", "new_password": "a-new-password" }),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "old password incorrect");

    let (status, body) = console
        .post(
            &client,
            "/api/change_password",
            json!({ "old_password": ADMIN_PASSWORD, "new_password": "a-new-password" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "password changed");

    // The changing session survives, the other one is signed out
    assert_eq!(console.get(&client, "/api/check").await.0, StatusCode::OK);
    assert_eq!(
        console.get(&other, "/api/check").await.0,
        StatusCode::UNAUTHORIZED
    );

    let fresh = console.client();
    let (status, _) = console
        .post(
            &fresh,
            "/login",
            json!({ "username": "admin", "password": ADMIN_PASSWORD }),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = console
        .post(
            &fresh,
            "/login",
            json!({ "username": "admin", "password": "a-new-password" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_invalid_domains_have_no_side_effects() {
    init_test();
    let console = TestConsole::start().await;
    let client = console.login().await;

    for domain in ["../../etc", "a..b.com", "bad domain.com", "x.com/../../y", "évil.com"] {
        let (status, body) = console
            .post(
                &client,
                "/api/register",
                json!({
                    "token": "cf-token",
                    "account_id": "acct-1",
                    "domain": domain,
                    "zone_id": "zone-1",
                    "local_port": "8080"
                }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", domain);
        assert_eq!(body["error"], "invalid domain name");

        let (status, body) = console
            .post(&client, "/api/delete", json!({ "domain": domain }))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", domain);
        assert_eq!(body["error"], "invalid domain");
    }

    assert!(console.cloudflare.calls().is_empty());
    for dir in ["configs", "yml", "creds"] {
        assert_eq!(std::fs::read_dir(console.path(dir)).unwrap().count(), 0);
    }
    assert!(console.path("users.json").exists());
}

#[tokio::test]
async fn test_request_errors() {
    init_test();
    let console = TestConsole::start().await;
    let client = console.login().await;

    let response = client
        .post(console.url("/api/run"))
        .header("content-type", "application/json")
        .body("{\"domain\":")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "invalid JSON body");

    let (status, body) = console.get(&client, "/api/unknown").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not found");

    let (status, _) = console.get(&client, "/api/register").await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

    let (status, body) = console
        .post(&client, "/api/delete", json!({ "domain": "missing.example.com" }))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "domain not found");
}

#[tokio::test]
async fn test_list_skips_unreadable_records() {
    init_test();
    let console = TestConsole::start().await;
    let client = console.login().await;

    let (status, body) = console.get(&client, "/api/list").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"], json!([]));

    std::fs::write(console.path("configs/garbage.json"), "not json at all").unwrap();
    std::fs::write(
        console.path("configs/partial.json"),
        r#"{"domain":"partial.example.com"}"#,
    )
    .unwrap();
    std::fs::write(
        console.path("configs/legacy.example.com.json"),
        r#"{"api_token":"dG9rZW4=","domain":"legacy.example.com","local_port":"80","yml_path":"/tmp/legacy.yml"}"#,
    )
    .unwrap();

    let (_, body) = console.get(&client, "/api/list").await;
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["domain"], "legacy.example.com");
    assert_eq!(items[0]["running"], false);
}
