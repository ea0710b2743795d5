use crate::backend::{Backend, ConnectionGuard};
use crate::error::{json_error_response, no_backend_response, ProxyErrorCode, ResponseBody};
use crate::loadbalancer::LoadBalancer;
use crate::session::{SessionBinding, SessionManager};
use crate::upstream::{UpstreamClient, UpstreamError};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, SET_COOKIE};
use hyper::http::request::Parts;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
/// Identifies this proxy to backends
const X_PROXY_SERVER: &str = "x-proxy-server";
/// Sticky session key the request was routed by
const X_STICKY_SESSION_ID: &str = "x-sticky-session-id";
/// Backend that produced the response
const X_SERVED_BY: &str = "x-served-by";

const PROXY_SERVER_NAME: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Default limit on buffered request bodies
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Default limit on reading request headers, idle keep-alive included
pub const DEFAULT_HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection-scoped headers that must not be forwarded
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

type ProxyResponse = Response<ResponseBody>;

/// Routes a single request: sticky lookup, balancer selection, forwarding
/// and one failover attempt.
pub struct ProxyHandler {
    balancer: Arc<dyn LoadBalancer>,
    upstream: Arc<UpstreamClient>,
    sessions: Option<Arc<SessionManager>>,
    max_body_bytes: usize,
}

impl ProxyHandler {
    pub fn new(balancer: Arc<dyn LoadBalancer>, upstream: Arc<UpstreamClient>) -> Self {
        Self {
            balancer,
            upstream,
            sessions: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    /// Enable sticky sessions
    pub fn with_sessions(mut self, sessions: Arc<SessionManager>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn balancer(&self) -> &Arc<dyn LoadBalancer> {
        &self.balancer
    }

    pub fn sessions(&self) -> Option<&Arc<SessionManager>> {
        self.sessions.as_ref()
    }

    /// Handle one client request end to end
    pub async fn serve<B>(&self, req: Request<B>, client_addr: SocketAddr, is_tls: bool) -> ProxyResponse
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let start = Instant::now();
        let (mut parts, body) = req.into_parts();

        let request_id = parts
            .headers
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        debug!(method = %parts.method, uri = %parts.uri, client = %client_addr, request_id, "Incoming request");

        let body = match self.read_body(&parts.headers, body).await {
            Ok(body) => body,
            Err(response) => return response,
        };

        let pool = self.balancer.pool();
        let mut binding: Option<SessionBinding> = None;
        let mut session_key: Option<String> = None;

        let sticky_hit = self
            .sessions
            .as_ref()
            .and_then(|sessions| sessions.get_backend_for_request(&parts.headers, client_addr, pool));

        let backend = match sticky_hit {
            Some(hit) => {
                session_key = Some(hit.key);
                hit.backend
            }
            None => {
                let Some(backend) = self.balancer.get_next_valid_peer() else {
                    warn!(method = %parts.method, path = parts.uri.path(), "No backends available");
                    return no_backend_response(pool.count(), pool.count_alive());
                };
                if let Some(ref sessions) = self.sessions {
                    let new_binding = sessions.set_session(&parts.headers, client_addr, &backend);
                    session_key = Some(new_binding.key.clone());
                    binding = Some(new_binding);
                }
                backend
            }
        };

        prepare_forward_headers(&mut parts, client_addr, is_tls, &request_id, session_key.as_deref());

        let first_error = match self.forward(&backend, &parts, &body).await {
            Ok((response, guard)) => {
                return self.finish(response, guard, binding, &parts, start);
            }
            Err(e) => e,
        };

        warn!(
            url = %backend.url(),
            error = %first_error,
            request_id,
            "Forwarding failed, retrying with a different backend"
        );
        self.mark_failed(&backend);

        let Some(replacement) = self.balancer.get_next_valid_peer() else {
            warn!(request_id, "No replacement backend available");
            return no_backend_response(pool.count(), pool.count_alive());
        };

        if let Some(ref sessions) = self.sessions {
            let new_binding = sessions.set_session(&parts.headers, client_addr, &replacement);
            set_header(&mut parts.headers, X_STICKY_SESSION_ID, &new_binding.key);
            binding = Some(new_binding);
        }

        match self.forward(&replacement, &parts, &body).await {
            Ok((response, guard)) => self.finish(response, guard, binding, &parts, start),
            Err(e) => {
                error!(url = %replacement.url(), error = %e, request_id, "Failover attempt failed");
                self.mark_failed(&replacement);
                if e.is_timeout() {
                    json_error_response(
                        ProxyErrorCode::RequestTimeout,
                        format!(
                            "Request timed out after {} seconds",
                            self.upstream.config().request_timeout.as_secs()
                        ),
                    )
                } else {
                    json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend")
                }
            }
        }
    }

    /// Buffer the request body so it can be replayed on failover
    async fn read_body<B>(&self, headers: &HeaderMap, body: B) -> Result<Bytes, ProxyResponse>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let declared = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if declared.is_some_and(|len| len > self.max_body_bytes as u64) {
            return Err(self.payload_too_large());
        }

        match Limited::new(body, self.max_body_bytes).collect().await {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => Err(self.payload_too_large()),
            Err(e) => {
                debug!(error = %e, "Failed to read request body");
                Err(json_error_response(
                    ProxyErrorCode::InvalidRequest,
                    "Failed to read request body",
                ))
            }
        }
    }

    fn payload_too_large(&self) -> ProxyResponse {
        json_error_response(
            ProxyErrorCode::PayloadTooLarge,
            format!("Request body exceeds {} bytes", self.max_body_bytes),
        )
    }

    /// One attempt against `backend`. The connection count is held until the
    /// returned guard (and the response body carrying it) is dropped.
    async fn forward(
        &self,
        backend: &Arc<Backend>,
        parts: &Parts,
        body: &Bytes,
    ) -> Result<(ProxyResponse, ConnectionGuard), UpstreamError> {
        let guard = backend.acquire();

        let mut outgoing = Request::new(Full::new(body.clone()));
        *outgoing.method_mut() = parts.method.clone();
        *outgoing.uri_mut() = parts.uri.clone();
        *outgoing.headers_mut() = parts.headers.clone();

        debug!(url = %backend.url(), method = %parts.method, path = parts.uri.path(), "Forwarding request");

        let response = self.upstream.send_request(backend, outgoing).await?;
        Ok((response, guard))
    }

    /// Record a transport failure: mark the backend dead and drop its sessions
    fn mark_failed(&self, backend: &Backend) {
        self.balancer.set_backend_status(backend.url(), false);
        // The backend may already have been dead or removed, in which case
        // no transition fired to clear its sessions.
        if let Some(ref sessions) = self.sessions {
            sessions.clear_session_for_backend(backend);
        }
    }

    fn finish(
        &self,
        response: ProxyResponse,
        guard: ConnectionGuard,
        binding: Option<SessionBinding>,
        parts: &Parts,
        start: Instant,
    ) -> ProxyResponse {
        let (mut resp_parts, body) = response.into_parts();
        let backend_url = guard.backend().url().to_string();

        info!(
            method = %parts.method,
            path = parts.uri.path(),
            backend = %backend_url,
            status = resp_parts.status.as_u16(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Request completed"
        );

        strip_hop_by_hop(&mut resp_parts.headers);
        set_header(&mut resp_parts.headers, X_SERVED_BY, &backend_url);
        if let Some(binding) = binding {
            resp_parts.headers.append(SET_COOKIE, binding.cookie);
        }

        let body = body
            .map_frame(move |frame| {
                let _connection = &guard;
                frame
            })
            .boxed();

        Response::from_parts(resp_parts, body)
    }
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// Remove hop-by-hop headers, including any named in `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Rewrite request headers for the upstream hop.
///
/// X-Forwarded-* are overwritten rather than appended; this proxy is assumed
/// to be the first trusted hop.
fn prepare_forward_headers(
    parts: &mut Parts,
    client_addr: SocketAddr,
    is_tls: bool,
    request_id: &str,
    session_key: Option<&str>,
) {
    let host = parts
        .headers
        .get(HOST)
        .cloned()
        .or_else(|| {
            parts
                .uri
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        });

    let headers = &mut parts.headers;
    strip_hop_by_hop(headers);

    set_header(headers, X_REQUEST_ID, request_id);
    set_header(headers, X_FORWARDED_FOR, &client_addr.ip().to_string());
    if let Some(host) = host {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(
        X_FORWARDED_PROTO,
        HeaderValue::from_static(if is_tls { "https" } else { "http" }),
    );
    headers.insert(X_PROXY_SERVER, HeaderValue::from_static(PROXY_SERVER_NAME));

    match session_key {
        Some(key) => set_header(headers, X_STICKY_SESSION_ID, key),
        None => {
            headers.remove(X_STICKY_SESSION_ID);
        }
    }
}

/// The client-facing proxy listener
pub struct ProxyServer {
    bind_addr: SocketAddr,
    handler: Arc<ProxyHandler>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
    header_read_timeout: Duration,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        handler: Arc<ProxyHandler>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            handler,
            shutdown_rx,
            tls_acceptor: None,
            header_read_timeout: DEFAULT_HEADER_READ_TIMEOUT,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    /// Close connections that do not deliver request headers within `timeout`
    pub fn with_header_read_timeout(mut self, timeout: Duration) -> Self {
        self.header_read_timeout = timeout;
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already-bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(
            addr = %local_addr,
            protocol,
            strategy = %self.handler.balancer().strategy(),
            backends = self.handler.balancer().pool().count(),
            sticky_sessions = self.handler.sessions().is_some(),
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();
        let tls_acceptor = self.tls_acceptor.clone();
        let header_read_timeout = self.header_read_timeout;

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let handler = Arc::clone(&self.handler);
                            let tls_acceptor = tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, handler, true, header_read_timeout).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, handler, false, header_read_timeout).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    handler: Arc<ProxyHandler>,
    is_tls: bool,
    header_read_timeout: Duration,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let handler = Arc::clone(&handler);
        async move { Ok::<_, hyper::Error>(handler.serve(req, addr, is_tls).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .timer(TokioTimer::new())
        .header_read_timeout(header_read_timeout)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadbalancer::{build_balancer, Strategy};
    use crate::pool::ServerPool;
    use crate::session::SessionConfig;
    use hyper::StatusCode;

    fn client() -> SocketAddr {
        "192.0.2.10:51000".parse().unwrap()
    }

    fn refused_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{}", port)
    }

    fn handler_for(urls: &[String]) -> ProxyHandler {
        let pool = Arc::new(ServerPool::with_backends(
            urls.iter().map(|u| Backend::new(u).unwrap()),
        ));
        ProxyHandler::new(
            build_balancer(Strategy::RoundRobin, pool),
            Arc::new(UpstreamClient::default()),
        )
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-custom-hop"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-custom-hop", HeaderValue::from_static("1"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("x-kept", HeaderValue::from_static("yes"));

        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("x-kept").unwrap(), "yes");
    }

    #[test]
    fn test_prepare_forward_headers_overwrites_spoofed_values() {
        let (mut parts, _) = Request::builder()
            .uri("/path")
            .header(HOST, "shop.example.com")
            .header(X_FORWARDED_FOR, "6.6.6.6")
            .header(X_STICKY_SESSION_ID, "forged")
            .body(())
            .unwrap()
            .into_parts();

        prepare_forward_headers(&mut parts, client(), true, "req-1", None);

        assert_eq!(parts.headers.get(X_FORWARDED_FOR).unwrap(), "192.0.2.10");
        assert_eq!(parts.headers.get(X_FORWARDED_HOST).unwrap(), "shop.example.com");
        assert_eq!(parts.headers.get(X_FORWARDED_PROTO).unwrap(), "https");
        assert_eq!(parts.headers.get(X_PROXY_SERVER).unwrap(), PROXY_SERVER_NAME);
        assert_eq!(parts.headers.get(X_REQUEST_ID).unwrap(), "req-1");
        assert_eq!(parts.headers.get(HOST).unwrap(), "shop.example.com");
        assert!(parts.headers.get(X_STICKY_SESSION_ID).is_none());
    }

    #[test]
    fn test_prepare_forward_headers_sticky_key() {
        let (mut parts, _) = Request::builder()
            .uri("http://api.example.com/x")
            .body(())
            .unwrap()
            .into_parts();

        prepare_forward_headers(&mut parts, client(), false, "req-2", Some("abc"));

        assert_eq!(parts.headers.get(X_STICKY_SESSION_ID).unwrap(), "abc");
        assert_eq!(parts.headers.get(X_FORWARDED_HOST).unwrap(), "api.example.com");
        assert_eq!(parts.headers.get(X_FORWARDED_PROTO).unwrap(), "http");
    }

    #[tokio::test]
    async fn test_no_backends_returns_503() {
        let handler = handler_for(&[]);
        let req = Request::builder().uri("/").body(Full::new(Bytes::new())).unwrap();

        let response = handler.serve(req, client(), false).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "NO_BACKEND_AVAILABLE");
    }

    #[tokio::test]
    async fn test_oversized_body_returns_413() {
        let handler = handler_for(&["http://127.0.0.1:1".to_string()]).with_max_body_bytes(8);
        let req = Request::builder()
            .method("POST")
            .uri("/upload")
            .body(Full::new(Bytes::from_static(b"way more than eight bytes")))
            .unwrap();

        let response = handler.serve(req, client(), false).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        // Nothing was selected or counted
        let backend = handler.balancer().pool().get_all()[0].clone();
        assert_eq!(backend.current_connections(), 0);
        assert_eq!(handler.balancer().pool().current_cursor(), 0);
    }

    #[tokio::test]
    async fn test_single_refused_backend_marked_dead() {
        let url = refused_url();
        let handler = handler_for(&[url.clone()]);
        let req = Request::builder().uri("/").body(Full::new(Bytes::new())).unwrap();

        let response = handler.serve(req, client(), false).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let backend = handler.balancer().pool().get_by_url(&url).unwrap();
        assert!(!backend.is_alive());
        assert_eq!(backend.current_connections(), 0);
    }

    #[tokio::test]
    async fn test_both_backends_refused_returns_502() {
        let first = refused_url();
        let second = refused_url();
        let sessions = Arc::new(SessionManager::new(SessionConfig::default()));
        let handler = handler_for(&[first.clone(), second.clone()]).with_sessions(Arc::clone(&sessions));

        let req = Request::builder().uri("/").body(Full::new(Bytes::new())).unwrap();
        let response = handler.serve(req, client(), false).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "CONNECTION_FAILED");

        let pool = handler.balancer().pool();
        assert_eq!(pool.count_alive(), 0);
        for backend in pool.get_all() {
            assert_eq!(backend.current_connections(), 0);
        }
        assert_eq!(sessions.get_stats().total_sessions, 0);
    }
}
