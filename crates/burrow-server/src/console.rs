//! Console state and request dispatch
//!
//! `Console::handle` takes a transport-independent `ApiRequest` and returns an
//! `ApiResponse`. Routing, rate limiting and the session check all happen here
//! before any handler runs; the hyper surface only converts to and from HTTP.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use hyper::header::{HeaderName, LOCATION, SET_COOKIE};
use hyper::{Method, StatusCode};
use serde_json::{json, Map, Value};

use crate::cloudflare::CloudflareClient;
use crate::config::ResolvedConfig;
use crate::credentials::{CredentialError, CredentialStore, InitOutcome};
use crate::domain_store::DomainStore;
use crate::error::{ConsoleError, Result};
use crate::ingress::TunnelFiles;
use crate::launcher::ProcessLauncher;
use crate::rate_limit::{RateLimiter, Scope};
use crate::session::{clear_session_cookie, session_cookie, SessionStore};
use crate::tunnel_api::TunnelApi;

const INDEX_HTML: &str = include_str!("../static/index.html");
const LOGIN_HTML: &str = include_str!("../static/login.html");
const MAIN_JS: &str = include_str!("../static/main.js");

/// Decoded JSON request body
pub(crate) type Body = Map<String, Value>;

/// A request as the console sees it
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    /// Value of the session cookie, if the client sent one
    pub session: Option<String>,
    pub client_ip: IpAddr,
    pub body: Bytes,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>, client_ip: IpAddr) -> Self {
        Self {
            method,
            path: path.into(),
            session: None,
            client_ip,
            body: Bytes::new(),
        }
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_json(mut self, body: &Value) -> Self {
        self.body = Bytes::from(body.to_string());
        self
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub headers: Vec<(HeaderName, String)>,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn json(status: StatusCode, value: &Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            headers: Vec::new(),
            body: Bytes::from(value.to_string()),
        }
    }

    fn text(content_type: &'static str, body: String) -> Self {
        Self {
            status: StatusCode::OK,
            content_type,
            headers: Vec::new(),
            body: Bytes::from(body),
        }
    }

    fn redirect(location: &str) -> Self {
        Self {
            status: StatusCode::FOUND,
            content_type: "text/plain; charset=utf-8",
            headers: vec![(LOCATION, location.to_string())],
            body: Bytes::new(),
        }
    }

    fn error(err: &ConsoleError) -> Self {
        Self::json(err.status(), &err.to_json())
    }

    fn with_cookie(mut self, cookie: String) -> Self {
        self.headers.push((SET_COOKIE, cookie));
        self
    }

    /// Parsed JSON body (None for pages and redirects)
    pub fn json_body(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }

    pub fn header(&self, name: &HeaderName) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    LoginPage,
    Login,
    Logout,
    Index,
    Script,
    ChangePassword,
    Check,
    TempTunnel,
    Zones,
    Register,
    List,
    Delete,
    Run,
    Stop,
    StartNode,
    StopNode,
}

impl Route {
    fn resolve(method: &Method, path: &str) -> Result<Route> {
        let (expected, route) = match path {
            "/login" => {
                return match *method {
                    Method::GET => Ok(Route::LoginPage),
                    Method::POST => Ok(Route::Login),
                    _ => Err(ConsoleError::MethodNotAllowed),
                }
            }
            "/" => (Method::GET, Route::Index),
            "/logout" => (Method::POST, Route::Logout),
            "/static/main.js" => (Method::GET, Route::Script),
            "/api/change_password" => (Method::POST, Route::ChangePassword),
            "/api/check" => (Method::GET, Route::Check),
            "/api/temp_tunnel" => (Method::POST, Route::TempTunnel),
            "/api/zones" => (Method::POST, Route::Zones),
            "/api/register" => (Method::POST, Route::Register),
            "/api/list" => (Method::GET, Route::List),
            "/api/delete" => (Method::POST, Route::Delete),
            "/api/run" => (Method::POST, Route::Run),
            "/api/stop" => (Method::POST, Route::Stop),
            "/api/start_node" => (Method::POST, Route::StartNode),
            "/api/stop_node" => (Method::POST, Route::StopNode),
            _ => return Err(ConsoleError::NotFound("not found".to_string())),
        };

        if *method == expected {
            Ok(route)
        } else {
            Err(ConsoleError::MethodNotAllowed)
        }
    }

    fn is_public(self) -> bool {
        matches!(
            self,
            Route::LoginPage | Route::Login | Route::Logout | Route::Script
        )
    }

    /// Budget the route draws from; `None` is unmetered
    fn scope(self) -> Option<Scope> {
        match self {
            Route::Login => Some(Scope::Login),
            Route::ChangePassword => Some(Scope::ChangePassword),
            Route::Script => None,
            _ => Some(Scope::Default),
        }
    }
}

/// The authenticated caller of a request
pub(crate) struct Caller {
    pub username: String,
    pub session: String,
}

/// Shared console state
pub struct Console {
    pub(crate) config: ResolvedConfig,
    pub(crate) credentials: Arc<CredentialStore>,
    pub(crate) domains: DomainStore,
    pub(crate) files: TunnelFiles,
    pub(crate) api: Arc<dyn TunnelApi>,
    pub(crate) launcher: ProcessLauncher,
    pub(crate) sessions: SessionStore,
    limiter: RateLimiter,
}

impl Console {
    /// Prepare the directory layout and the admin account, then build the console
    pub fn new(config: ResolvedConfig, api: Arc<dyn TunnelApi>) -> anyhow::Result<Arc<Self>> {
        config.ensure_dirs().with_context(|| {
            format!("Failed to create directories under {}", config.main_dir.display())
        })?;

        let credentials = CredentialStore::new(config.users_file());
        match credentials.initialize(config.admin_password.as_deref())? {
            InitOutcome::Created => tracing::info!("Admin account created"),
            InitOutcome::Existing => tracing::debug!("Using existing users file"),
        }

        Ok(Arc::new(Self {
            credentials: Arc::new(credentials),
            domains: DomainStore::new(config.configs_dir()),
            files: TunnelFiles::new(config.creds_dir(), config.yml_dir()),
            api,
            launcher: ProcessLauncher::new(),
            sessions: SessionStore::new(config.session_ttl),
            limiter: RateLimiter::new(config.rate_limits),
            config,
        }))
    }

    /// Console backed by the Cloudflare API at `config.api_base`
    pub fn with_cloudflare(config: ResolvedConfig) -> anyhow::Result<Arc<Self>> {
        let client = CloudflareClient::new(&config.api_base, config.api_timeout)
            .context("Failed to build Cloudflare API client")?;
        Self::new(config, Arc::new(client))
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn launcher(&self) -> &ProcessLauncher {
        &self.launcher
    }

    /// Stop every child process (shutdown)
    pub async fn shutdown(&self) {
        tracing::info!("Stopping managed processes...");
        self.launcher.stop_all().await;
    }

    pub async fn handle(&self, req: ApiRequest) -> ApiResponse {
        tracing::debug!("{} {} from {}", req.method, req.path, req.client_ip);

        let route = match Route::resolve(&req.method, &req.path) {
            Ok(route) => route,
            Err(e) => return ApiResponse::error(&e),
        };

        if let Some(scope) = route.scope() {
            if !self.limiter.check(scope, req.client_ip) {
                return ApiResponse::error(&ConsoleError::RateLimited);
            }
        }

        let caller = req.session.as_deref().and_then(|id| {
            self.sessions.validate(id).map(|username| Caller {
                username,
                session: id.to_string(),
            })
        });

        let caller = match (route.is_public(), caller) {
            (true, caller) => caller,
            (false, Some(caller)) => Some(caller),
            (false, None) => {
                if req.method == Method::GET && !req.path.starts_with("/api/") {
                    return ApiResponse::redirect("/login");
                }
                return ApiResponse::error(&ConsoleError::Unauthorized("unauthorized".to_string()));
            }
        };

        match route {
            Route::LoginPage => {
                return ApiResponse::text("text/html; charset=utf-8", LOGIN_HTML.to_string())
            }
            Route::Script => {
                return ApiResponse::text(
                    "application/javascript; charset=utf-8",
                    MAIN_JS.to_string(),
                )
            }
            Route::Index => {
                let username = caller.as_ref().map(|c| c.username.as_str()).unwrap_or("");
                return ApiResponse::text(
                    "text/html; charset=utf-8",
                    INDEX_HTML.replace("{{username}}", &display_name(username)),
                );
            }
            _ => {}
        }

        let body = match parse_body(&req.body) {
            Ok(body) => body,
            Err(e) => return ApiResponse::error(&e),
        };

        let result = match route {
            Route::Login => return self.login(&body).await,
            Route::Logout => return self.logout(caller.as_ref().map(|c| c.session.as_str())),
            Route::ChangePassword => match caller.as_ref() {
                Some(caller) => self.change_password(caller, &body).await,
                None => Err(ConsoleError::Unauthorized("unauthorized".to_string())),
            },
            Route::Check => Ok(self.check()),
            Route::TempTunnel => self.temp_tunnel(&body).await,
            Route::Zones => self.zones(&body).await,
            Route::Register => self.register(&body).await,
            Route::List => Ok(self.list().await),
            Route::Delete => self.delete(&body).await,
            Route::Run => self.run(&body).await,
            Route::Stop => self.stop(&body).await,
            Route::StartNode => self.start_node(&body).await,
            Route::StopNode => Ok(self.stop_node().await),
            Route::LoginPage | Route::Script | Route::Index => Ok(json!({ "ok": true })),
        };

        match result {
            Ok(value) => ApiResponse::json(StatusCode::OK, &value),
            Err(e) => {
                if e.status().is_server_error() {
                    tracing::error!("{} {} failed: {}", req.method, req.path, e);
                } else {
                    tracing::debug!("{} {} rejected: {}", req.method, req.path, e);
                }
                ApiResponse::error(&e)
            }
        }
    }

    async fn login(&self, body: &Body) -> ApiResponse {
        let username = str_field(body, "username").unwrap_or_default().to_string();
        let password = body
            .get("password")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let credentials = self.credentials.clone();
        let user = username.clone();
        let verified =
            tokio::task::spawn_blocking(move || credentials.authenticate(&user, &password))
                .await
                .unwrap_or(false);

        if !verified {
            tracing::warn!("Failed login for '{}'", username);
            return ApiResponse::error(&ConsoleError::Unauthorized(
                "invalid username or password".to_string(),
            ));
        }

        let session = self.sessions.create(&username);
        tracing::info!("{} logged in", username);
        ApiResponse::json(
            StatusCode::OK,
            &json!({ "ok": true, "message": "login success" }),
        )
        .with_cookie(session_cookie(
            &session,
            self.sessions.ttl(),
            self.config.secure_cookies,
        ))
    }

    fn logout(&self, session: Option<&str>) -> ApiResponse {
        if let Some(session) = session {
            self.sessions.remove(session);
        }
        ApiResponse::json(StatusCode::OK, &json!({ "ok": true }))
            .with_cookie(clear_session_cookie(self.config.secure_cookies))
    }

    async fn change_password(&self, caller: &Caller, body: &Body) -> Result<Value> {
        let too_short = || ConsoleError::validation(CredentialError::PasswordTooShort.to_string());

        let old_password = body
            .get("old_password")
            .and_then(Value::as_str)
            .filter(|p| !p.is_empty())
            .ok_or_else(too_short)?
            .to_string();
        let new_password = body
            .get("new_password")
            .and_then(Value::as_str)
            .filter(|p| !p.is_empty())
            .ok_or_else(too_short)?
            .to_string();

        let credentials = self.credentials.clone();
        let username = caller.username.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            credentials.change_password(&username, &old_password, &new_password)
        })
        .await
        .map_err(|e| ConsoleError::Internal(format!("password change aborted: {}", e)))?;

        match outcome {
            Ok(()) => {}
            Err(CredentialError::PasswordTooShort) => return Err(too_short()),
            Err(CredentialError::WrongPassword) => {
                return Err(ConsoleError::Unauthorized(
                    CredentialError::WrongPassword.to_string(),
                ))
            }
            Err(e) => return Err(ConsoleError::Internal(e.to_string())),
        }

        let dropped = self
            .sessions
            .invalidate_user(&caller.username, Some(&caller.session));
        if dropped > 0 {
            tracing::info!("Ended {} other session(s) of {}", dropped, caller.username);
        }

        Ok(json!({ "ok": true, "message": "password changed" }))
    }

    fn check(&self) -> Value {
        json!({
            "ok": true,
            "cloudflared": crate::launcher::binary_available(&self.config.tunnel_bin),
            "xray": crate::launcher::binary_available(&self.config.proxy_bin),
            "main_dir": self.config.main_dir.display().to_string(),
        })
    }
}

/// Empty bodies decode to an empty object; anything but a JSON object is rejected
fn parse_body(body: &Bytes) -> Result<Body> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Body::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(Value::Null) => Ok(Body::new()),
        _ => Err(ConsoleError::validation("invalid JSON body")),
    }
}

/// A non-empty, trimmed string field
pub(crate) fn str_field<'a>(body: &'a Body, key: &str) -> Option<&'a str> {
    body.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Username as shown in the page header
fn display_name(username: &str) -> String {
    username
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect()
}
