use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE, COOKIE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::console::{ApiRequest, ApiResponse, Console};
use crate::session::session_from_cookie_header;

/// Largest request body the console reads
const MAX_BODY_BYTES: usize = 64 * 1024;

/// HTTP(S) front of the console
pub struct HttpSurface {
    console: Arc<Console>,
    /// Optional TLS acceptor for HTTPS mode
    tls_acceptor: Option<TlsAcceptor>,
}

impl HttpSurface {
    pub fn new(console: Arc<Console>, tls_acceptor: Option<TlsAcceptor>) -> Arc<Self> {
        Arc::new(Self {
            console,
            tls_acceptor,
        })
    }

    /// Serve an HTTP connection on any AsyncRead + AsyncWrite stream
    async fn serve_connection<S>(self: Arc<Self>, stream: S, peer_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req| {
            let this = self.clone();
            async move { this.handle_request(req, peer_addr).await }
        });

        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
            tracing::debug!("HTTP connection error from {}: {}", peer_addr, e);
        }
    }

    /// Bind `addr` and serve until the listener fails
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already bound listener
    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        if self.tls_acceptor.is_some() {
            tracing::info!("Console listening on https://{}", addr);
        } else {
            tracing::info!("Console listening on http://{}", addr);
        }

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            tracing::debug!("Connection from {}", peer_addr);
            let this = self.clone();

            tokio::spawn(async move {
                if let Some(ref acceptor) = this.tls_acceptor {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            this.serve_connection(tls_stream, peer_addr).await;
                        }
                        Err(e) => {
                            tracing::warn!("TLS handshake failed from {}: {}", peer_addr, e);
                        }
                    }
                } else {
                    this.serve_connection(stream, peer_addr).await;
                }
            });
        }
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
        peer_addr: SocketAddr,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let session = req
            .headers()
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(session_from_cookie_header)
            .map(str::to_string);

        let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!("Rejected request body from {}: {}", peer_addr, e);
                return Ok(into_response(ApiResponse::json(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    &json!({ "ok": false, "error": "request body too large" }),
                )));
            }
        };

        let request = ApiRequest {
            method,
            path,
            session,
            client_ip: peer_addr.ip(),
            body,
        };

        Ok(into_response(self.console.handle(request).await))
    }
}

fn into_response(api: ApiResponse) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(api.body));
    *response.status_mut() = api.status;

    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(api.content_type));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    for (name, value) in api.headers {
        match HeaderValue::from_str(&value) {
            Ok(value) => {
                headers.append(name, value);
            }
            Err(e) => tracing::warn!("Dropping invalid {} header: {}", name, e),
        }
    }
    response
}
