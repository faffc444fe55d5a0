//! Mock Cloudflare v4 API for E2E tests
//!
//! Answers the zone, tunnel, ingress configuration and DNS record endpoints
//! the console uses, and records every request for assertions.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::net::TcpListener;

/// Path prefix the mock serves under, like the real API
pub const API_PREFIX: &str = "/client/v4";

/// A recorded API call
#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub method: String,
    /// Path without the `/client/v4` prefix
    pub path: String,
    pub authorization: Option<String>,
    pub body: Value,
}

#[derive(Default)]
struct MockState {
    calls: RwLock<Vec<RecordedCall>>,
    tunnels: AtomicUsize,
    failing: AtomicBool,
    tunnel_id_override: RwLock<Option<String>>,
}

pub struct MockCloudflare {
    addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockCloudflare {
    /// Start the mock API on an ephemeral port
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock Cloudflare API");
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockState::default());

        let state_clone = state.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let state = state_clone.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(handle(state, req).await) }
                    });
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        tracing::debug!("Mock Cloudflare connection error: {}", e);
                    }
                });
            }
        });

        Self { addr, state }
    }

    /// Base URL to configure as the console's `api_base`
    pub fn api_base(&self) -> String {
        format!("http://{}{}", self.addr, API_PREFIX)
    }

    /// Answer every call with `success: false`
    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }

    /// Answer tunnel creation with `id` instead of a well-formed id
    pub fn set_tunnel_id(&self, id: Option<&str>) {
        *self.state.tunnel_id_override.write() = id.map(str::to_string);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.calls.read().clone()
    }

    pub fn calls_to(&self, method: &str, path_suffix: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.method == method && c.path.ends_with(path_suffix))
            .collect()
    }

    /// Tunnel token the mock issues for the n-th created tunnel
    pub fn tunnel_token(n: usize) -> String {
        base64::engine::general_purpose::STANDARD.encode(Self::credential_blob(n))
    }

    /// Decoded form of `tunnel_token(n)`
    pub fn credential_blob(n: usize) -> String {
        format!(
            r#"{{"AccountTag":"acct-1","TunnelID":"{}","TunnelSecret":"c2VjcmV0"}}"#,
            Self::tunnel_id(n)
        )
    }

    /// Id of the n-th created tunnel
    pub fn tunnel_id(n: usize) -> String {
        format!("00000000-0000-4000-8000-{:012}", n)
    }
}

async fn handle(state: Arc<MockState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req
        .uri()
        .path()
        .strip_prefix(API_PREFIX)
        .unwrap_or(req.uri().path())
        .to_string();
    let authorization = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = req
        .into_body()
        .collect()
        .await
        .map(|b| b.to_bytes())
        .unwrap_or_default();
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

    state.calls.write().push(RecordedCall {
        method: method.to_string(),
        path: path.clone(),
        authorization,
        body,
    });

    if state.failing.load(Ordering::SeqCst) {
        return envelope(
            StatusCode::FORBIDDEN,
            json!({
                "success": false,
                "result": null,
                "errors": [{ "code": 10000, "message": "Authentication error" }]
            }),
        );
    }

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let result = match (&method, segments.as_slice()) {
        (&Method::GET, ["zones"]) => json!([
            { "id": "zone-1", "name": "example.com" },
            { "id": "zone-2", "name": "example.org" }
        ]),
        (&Method::GET, ["zones", zone_id]) => json!({
            "id": zone_id,
            "name": if *zone_id == "zone-2" { "example.org" } else { "example.com" }
        }),
        (&Method::POST, ["accounts", _, "tunnels"]) => {
            let n = state.tunnels.fetch_add(1, Ordering::SeqCst) + 1;
            let id = state
                .tunnel_id_override
                .read()
                .clone()
                .unwrap_or_else(|| MockCloudflare::tunnel_id(n));
            json!({
                "id": id,
                "name": format!("tunnel-{}", n),
                "token": MockCloudflare::tunnel_token(n)
            })
        }
        (&Method::PUT, ["accounts", _, "cfd_tunnel", _, "configurations"]) => json!({}),
        (&Method::POST, ["zones", _, "dns_records"]) => json!({ "id": "record-1" }),
        _ => {
            return envelope(
                StatusCode::NOT_FOUND,
                json!({
                    "success": false,
                    "result": null,
                    "errors": [{ "code": 7000, "message": "No route for that URI" }]
                }),
            )
        }
    };

    envelope(
        StatusCode::OK,
        json!({ "success": true, "result": result, "errors": [] }),
    )
}

fn envelope(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}
