//! HTTP client for forwarding requests and probing backends
//!
//! Keeps pooled keep-alive connections to every backend, so repeated requests
//! to the same upstream reuse sockets instead of reconnecting.

use crate::backend::Backend;
use crate::error::{BoxError, ResponseBody};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, Sleep};
use tracing::{debug, warn};

/// Error type for upstream operations
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Transport error from the HTTP client (refused, reset, DNS)
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// Error building the upstream request
    #[error("request build error: {0}")]
    RequestBuild(String),
    /// The exchange did not complete within the request timeout
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl UpstreamError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, UpstreamError::Timeout(_))
    }
}

/// Configuration for the upstream client
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Maximum idle connections per backend
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// Upper bound on a single forwarding attempt, response body included
    pub request_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Pooled HTTP client shared by the proxy handler and the health checker
pub struct UpstreamClient {
    /// Client for forwarded requests (bodies are buffered so they can be replayed)
    client: Client<HttpConnector, Full<Bytes>>,
    /// Dedicated client for health probes
    health_client: Client<HttpConnector, Empty<Bytes>>,
    config: UpstreamConfig,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        let health_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            request_timeout_secs = config.request_timeout.as_secs(),
            "Upstream client initialized"
        );

        Self {
            client,
            health_client,
            config,
        }
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// Forward a request to `backend`.
    ///
    /// `req` carries the original path and query in its URI; it is rewritten
    /// to target the backend. Headers are sent as given.
    ///
    /// The request timeout covers the whole exchange: once the headers are
    /// back, the remaining time bounds the response body, which fails with
    /// [`UpstreamError::Timeout`] if the backend stalls past it.
    pub async fn send_request(
        &self,
        backend: &Backend,
        req: Request<Full<Bytes>>,
    ) -> Result<Response<ResponseBody>, UpstreamError> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        let uri = backend.target_uri(&path_and_query);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder()
            .method(parts.method)
            .uri(&uri)
            .version(hyper::Version::HTTP_11);

        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let backend_req = builder
            .body(body)
            .map_err(|e| UpstreamError::RequestBuild(e.to_string()))?;

        let timeout = self.config.request_timeout;
        let deadline = Instant::now() + timeout;
        let response = match tokio::time::timeout_at(deadline, self.client.request(backend_req)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(UpstreamError::from(e)),
            Err(_) => return Err(UpstreamError::Timeout(timeout)),
        };

        let (parts, body) = response.into_parts();
        let body = DeadlineBody::new(body, deadline, timeout, uri);
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Probe `uri` with a GET and return the status code.
    ///
    /// Bounded by `timeout`; transport errors and timeouts yield `None`.
    pub async fn probe(&self, uri: &str, timeout: Duration) -> Option<StatusCode> {
        let req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(hyper::header::CONNECTION, "keep-alive")
            .header(hyper::header::USER_AGENT, concat!("relaygate-health/", env!("CARGO_PKG_VERSION")))
            .body(Empty::<Bytes>::new())
            .ok()?;

        match tokio::time::timeout(timeout, self.health_client.request(req)).await {
            Ok(Ok(response)) => Some(response.status()),
            Ok(Err(e)) => {
                debug!(uri, error = %e, "Health probe failed (connection error)");
                None
            }
            Err(_) => {
                debug!(uri, timeout_ms = timeout.as_millis() as u64, "Health probe failed (timeout)");
                None
            }
        }
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new(UpstreamConfig::default())
    }
}

/// Upstream response body that fails once the exchange deadline passes
struct DeadlineBody {
    inner: Incoming,
    deadline: Pin<Box<Sleep>>,
    timeout: Duration,
    uri: String,
}

impl DeadlineBody {
    fn new(inner: Incoming, deadline: Instant, timeout: Duration, uri: String) -> Self {
        Self {
            inner,
            deadline: Box::pin(tokio::time::sleep_until(deadline)),
            timeout,
            uri,
        }
    }
}

impl Body for DeadlineBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if let Poll::Ready(frame) = Pin::new(&mut this.inner).poll_frame(cx) {
            return Poll::Ready(frame.map(|result| result.map_err(BoxError::from)));
        }

        if this.deadline.as_mut().poll(cx).is_ready() {
            warn!(uri = %this.uri, timeout_secs = this.timeout.as_secs(), "Backend stalled while sending response body");
            return Poll::Ready(Some(Err(BoxError::from(UpstreamError::Timeout(this.timeout)))));
        }

        Poll::Pending
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
