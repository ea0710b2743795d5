//! Administrative HTTP API
//!
//! Read-only status endpoints plus runtime backend add/remove. Mutating calls
//! require `Authorization: Bearer <token>` when an admin token is configured.

use crate::backend::Backend;
use crate::config::{Config, ConfigSnapshot};
use crate::error::{json_error_response, ProxyErrorCode, ResponseBody};
use crate::proxy::DEFAULT_HEADER_READ_TIMEOUT;
use crate::healthcheck::HealthChecker;
use crate::loadbalancer::LoadBalancer;
use crate::session::SessionManager;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest admin request body accepted
const MAX_ADMIN_BODY_BYTES: usize = 64 * 1024;

type AdminResponse = Response<ResponseBody>;

/// Helper to create a JSON response from any serializable value
fn json_response<T: Serialize>(status: StatusCode, value: &T) -> AdminResponse {
    let body = match serde_json::to_vec(value) {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "Failed to serialize admin response");
            return json_error_response(ProxyErrorCode::InternalError, "Serialization failed");
        }
    };

    let mut response = Response::new(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Everything the admin endpoints read or mutate
pub struct AdminState {
    pub balancer: Arc<dyn LoadBalancer>,
    pub health_checker: Arc<HealthChecker>,
    pub sessions: Option<Arc<SessionManager>>,
    pub config: Arc<Config>,
}

impl AdminState {
    fn admin_token(&self) -> Option<&str> {
        self.config.server.admin_token.as_deref()
    }
}

#[derive(Debug, Deserialize)]
struct AddBackendRequest {
    url: Option<String>,
    weight: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RemoveBackendRequest {
    url: Option<String>,
}

/// Admin API server
pub struct AdminServer {
    bind_addr: SocketAddr,
    state: Arc<AdminState>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
    header_read_timeout: Duration,
}

impl AdminServer {
    pub fn new(bind_addr: SocketAddr, state: Arc<AdminState>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
            tls_acceptor: None,
            header_read_timeout: DEFAULT_HEADER_READ_TIMEOUT,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn with_header_read_timeout(mut self, timeout: Duration) -> Self {
        self.header_read_timeout = timeout;
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept admin connections on an already-bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(
            addr = %local_addr,
            protocol,
            auth = self.state.admin_token().is_some(),
            "Admin API server listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();
        let tls_acceptor = self.tls_acceptor.clone();
        let header_read_timeout = self.header_read_timeout;

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            let tls_acceptor = tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = serve_admin_connection(tls_stream, state, header_read_timeout).await {
                                                debug!(addr = %addr, error = %e, "Admin TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "Admin TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = serve_admin_connection(stream, state, header_read_timeout).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(
    stream: S,
    state: Arc<AdminState>,
    header_read_timeout: Duration,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { Ok::<_, hyper::Error>(handle_admin_request(req, state).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(header_read_timeout)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

/// Route one admin request
pub async fn handle_admin_request<B>(req: Request<B>, state: Arc<AdminState>) -> AdminResponse
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "Admin API request");

    match path.as_str() {
        "/" => match method {
            Method::GET => index(&state),
            _ => method_not_allowed(&method, &path),
        },

        "/status" => match method {
            Method::GET => json_response(StatusCode::OK, &state.balancer.get_status()),
            _ => method_not_allowed(&method, &path),
        },

        "/health" => match method {
            Method::GET => json_response(StatusCode::OK, &state.health_checker.get_health_check_stats()),
            _ => method_not_allowed(&method, &path),
        },

        "/backends" => match method {
            Method::GET => json_response(StatusCode::OK, &state.balancer.get_status().backends),
            Method::POST | Method::DELETE => {
                if let Some(token) = state.admin_token() {
                    if !check_auth(&req, token) {
                        warn!(%method, %path, "Unauthorized admin API request");
                        return json_error_response(ProxyErrorCode::Unauthorized, "Missing or invalid admin token");
                    }
                }
                if method == Method::POST {
                    add_backend(req, &state).await
                } else {
                    remove_backend(req, &state).await
                }
            }
            _ => method_not_allowed(&method, &path),
        },

        "/config" => match method {
            Method::GET => {
                let snapshot = ConfigSnapshot::new(
                    &state.config,
                    state.balancer.strategy(),
                    state.balancer.pool(),
                );
                json_response(StatusCode::OK, &snapshot)
            }
            _ => method_not_allowed(&method, &path),
        },

        "/sessions" => match method {
            Method::GET => match state.sessions {
                Some(ref sessions) => json_response(StatusCode::OK, &sessions.get_stats()),
                None => json_error_response(ProxyErrorCode::SessionsDisabled, "Sticky sessions not enabled"),
            },
            _ => method_not_allowed(&method, &path),
        },

        "/version" => match method {
            Method::GET => json_response(
                StatusCode::OK,
                &serde_json::json!({
                    "name": PKG_NAME,
                    "version": VERSION,
                }),
            ),
            _ => method_not_allowed(&method, &path),
        },

        _ => json_error_response(ProxyErrorCode::NotFound, format!("No admin endpoint at {}", path)),
    }
}

fn method_not_allowed(method: &Method, path: &str) -> AdminResponse {
    json_error_response(
        ProxyErrorCode::MethodNotAllowed,
        format!("Method {} not allowed on {}", method, path),
    )
}

fn index(state: &AdminState) -> AdminResponse {
    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "documentation": "relaygate admin API",
            "endpoints": {
                "GET /status": "Proxy status and backend list",
                "GET /health": "Health checker status",
                "GET /backends": "Backend list",
                "POST /backends": "Add a backend (JSON: {\"url\": \"http://...\", \"weight\": 1})",
                "DELETE /backends": "Remove a backend (JSON: {\"url\": \"http://...\"})",
                "GET /config": "Effective configuration",
                "GET /sessions": "Sticky session statistics (if enabled)",
                "GET /version": "Name and version",
            },
            "features": {
                "strategy": state.balancer.strategy(),
                "sticky_sessions": state.sessions.is_some(),
                "https_enabled": state.config.server.enable_https,
                "admin_auth": state.admin_token().is_some(),
            },
        }),
    )
}

/// Parse a JSON request body, mapping every failure to a 400 response
async fn read_json<B, T>(req: Request<B>) -> Result<T, AdminResponse>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    T: for<'de> Deserialize<'de>,
{
    let body = Limited::new(req.into_body(), MAX_ADMIN_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| {
            json_error_response(
                ProxyErrorCode::InvalidRequest,
                format!("Failed to read request body: {}", e),
            )
        })?
        .to_bytes();

    serde_json::from_slice(&body).map_err(|e| {
        json_error_response(ProxyErrorCode::InvalidRequest, format!("Invalid JSON: {}", e))
    })
}

fn require_url(url: Option<String>) -> Result<String, AdminResponse> {
    match url {
        Some(url) if !url.trim().is_empty() => Ok(url),
        _ => Err(json_error_response(ProxyErrorCode::InvalidRequest, "URL is required")),
    }
}

async fn add_backend<B>(req: Request<B>, state: &AdminState) -> AdminResponse
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let request: AddBackendRequest = match read_json(req).await {
        Ok(request) => request,
        Err(response) => return response,
    };
    let url = match require_url(request.url) {
        Ok(url) => url,
        Err(response) => return response,
    };

    let mut backend = match Backend::new(&url) {
        Ok(backend) => backend,
        Err(e) => return json_error_response(ProxyErrorCode::InvalidRequest, e.to_string()),
    };
    if let Some(weight) = request.weight {
        backend = backend.with_weight(weight);
    }

    let Some(added) = state.balancer.add_backend(backend) else {
        return json_error_response(
            ProxyErrorCode::BackendExists,
            format!("Backend already registered: {}", url.trim()),
        );
    };

    json_response(
        StatusCode::CREATED,
        &serde_json::json!({
            "message": "Backend added successfully",
            "backend": {
                "url": added.url(),
                "alive": added.is_alive(),
                "weight": added.weight(),
            },
            "total_backends": state.balancer.pool().count(),
        }),
    )
}

async fn remove_backend<B>(req: Request<B>, state: &AdminState) -> AdminResponse
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let request: RemoveBackendRequest = match read_json(req).await {
        Ok(request) => request,
        Err(response) => return response,
    };
    let url = match require_url(request.url) {
        Ok(url) => url,
        Err(response) => return response,
    };

    let before_total = state.balancer.pool().count();
    if !state.balancer.remove_backend(&url) {
        return json_error_response(
            ProxyErrorCode::BackendNotFound,
            format!("Backend not found: {}", url.trim()),
        );
    }

    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "message": "Backend removed successfully",
            "removed_backend": url.trim(),
            "before_total": before_total,
            "after_total": state.balancer.pool().count(),
        }),
    )
}
