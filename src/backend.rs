//! Upstream backend identity and runtime state
//!
//! A [`Backend`] is shared behind an `Arc` by the server pool, the balancers,
//! sticky sessions and in-flight requests. Liveness and the connection counter
//! are independent atomics so health-check writes and request-path reads never
//! contend on the pool lock. The weight is fixed at construction.

use hyper::Uri;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Weight given to backends that do not configure one
pub const DEFAULT_WEIGHT: u32 = 1;

/// Errors raised while validating a backend URL
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend URL is empty")]
    EmptyUrl,
    #[error("invalid backend URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unsupported scheme '{scheme}' in backend URL '{url}' (only http is supported)")]
    UnsupportedScheme { url: String, scheme: String },
}

/// Normalize a backend URL into the canonical string used for lookups.
///
/// The scheme and authority are lowercased, trailing slashes are dropped from
/// the path, and query strings or credentials are rejected. Two spellings of
/// the same backend (`http://Example:80/` and `http://example:80`) map to the
/// same key.
pub fn normalize_url(raw: &str) -> Result<String, BackendError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(BackendError::EmptyUrl);
    }

    let invalid = |reason: &str| BackendError::InvalidUrl {
        url: trimmed.to_string(),
        reason: reason.to_string(),
    };

    let uri: Uri = trimmed.parse().map_err(|e: hyper::http::uri::InvalidUri| {
        BackendError::InvalidUrl {
            url: trimmed.to_string(),
            reason: e.to_string(),
        }
    })?;

    let scheme = uri
        .scheme_str()
        .ok_or_else(|| invalid("missing scheme"))?
        .to_ascii_lowercase();
    if scheme != "http" {
        return Err(BackendError::UnsupportedScheme {
            url: trimmed.to_string(),
            scheme,
        });
    }

    let authority = uri.authority().ok_or_else(|| invalid("missing host"))?;
    if authority.host().is_empty() {
        return Err(invalid("missing host"));
    }
    if authority.as_str().contains('@') {
        return Err(invalid("credentials are not allowed"));
    }
    if uri.query().is_some() {
        return Err(invalid("query strings are not allowed"));
    }

    let path = uri.path().trim_end_matches('/');
    Ok(format!(
        "{}://{}{}",
        scheme,
        authority.as_str().to_ascii_lowercase(),
        path
    ))
}

/// A single upstream server
#[derive(Debug)]
pub struct Backend {
    id: Uuid,
    url: String,
    alive: AtomicBool,
    weight: u32,
    current_connections: AtomicUsize,
}

impl Backend {
    /// Create a backend from a URL. New backends start alive with weight 1.
    pub fn new(url: &str) -> Result<Self, BackendError> {
        Ok(Self {
            id: Uuid::new_v4(),
            url: normalize_url(url)?,
            alive: AtomicBool::new(true),
            weight: DEFAULT_WEIGHT,
            current_connections: AtomicUsize::new(0),
        })
    }

    /// Set the weight (builder pattern)
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Stable identifier, unique even if the same URL is re-added later
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Normalized URL, also the pool lookup key
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the URL carries a path beyond the authority
    pub fn has_path(&self) -> bool {
        let after_scheme = self.url.splitn(2, "://").nth(1).unwrap_or("");
        after_scheme.contains('/')
    }

    /// Build the upstream URI for a request path (which must start with `/`)
    pub fn target_uri(&self, path_and_query: &str) -> String {
        format!("{}{}", self.url, path_and_query)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Update liveness and return the previous value
    pub fn set_alive(&self, alive: bool) -> bool {
        self.alive.swap(alive, Ordering::AcqRel)
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn current_connections(&self) -> usize {
        self.current_connections.load(Ordering::Acquire)
    }

    /// Count a new connection against this backend.
    ///
    /// The count is released when the returned guard is dropped, so every
    /// increment is paired with exactly one decrement.
    pub fn acquire(self: &Arc<Self>) -> ConnectionGuard {
        self.current_connections.fetch_add(1, Ordering::AcqRel);
        ConnectionGuard {
            backend: Arc::clone(self),
        }
    }
}

/// Holds one unit of a backend's connection count
#[derive(Debug)]
pub struct ConnectionGuard {
    backend: Arc<Backend>,
}

impl ConnectionGuard {
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.backend
            .current_connections
            .fetch_sub(1, Ordering::AcqRel);
    }
}
