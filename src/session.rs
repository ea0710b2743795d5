//! Sticky sessions
//!
//! Binds a client to the backend that first served it. A binding is stored
//! under two keys: the opaque token carried in the `proxy_session` cookie and
//! the client's IP address, so clients that drop cookies still stick. Both
//! keys share one [`Session`], so refreshing either keeps the pair alive.

use crate::backend::Backend;
use crate::loadbalancer::BackendObserver;
use crate::pool::ServerPool;
use hyper::header::{HeaderMap, HeaderValue, COOKIE, USER_AGENT};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Name of the affinity cookie
pub const SESSION_COOKIE: &str = "proxy_session";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Idle time after which a binding expires
    pub ttl: Duration,
    /// Period of the expired-session sweep
    pub cleanup_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug)]
struct Session {
    backend: Arc<Backend>,
    /// Cookie token, reported whichever key the session is found under
    token: String,
    /// Milliseconds since the manager's epoch
    last_used: AtomicU64,
}

/// Backend found for a returning client
#[derive(Debug, Clone)]
pub struct SessionHit {
    pub backend: Arc<Backend>,
    /// Session token, also for hits found by client IP
    pub key: String,
}

/// A freshly created binding
#[derive(Debug, Clone)]
pub struct SessionBinding {
    pub key: String,
    /// Value for the response's `Set-Cookie` header
    pub cookie: HeaderValue,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub session_ttl: String,
    pub cleanup_interval: String,
}

struct CleanupTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    config: SessionConfig,
    epoch: Instant,
    cleanup: Mutex<Option<CleanupTask>>,
}

impl SessionManager {
    pub fn new(mut config: SessionConfig) -> Self {
        if config.ttl.is_zero() {
            config.ttl = SessionConfig::default().ttl;
        }
        if config.cleanup_interval.is_zero() {
            config.cleanup_interval = SessionConfig::default().cleanup_interval;
        }

        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
            epoch: Instant::now(),
            cleanup: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Look up the backend bound to this client, cookie first, then IP
    pub fn get_backend_for_request(
        &self,
        headers: &HeaderMap,
        client_addr: SocketAddr,
        pool: &ServerPool,
    ) -> Option<SessionHit> {
        self.get_backend_for_request_at(headers, client_addr, pool, Instant::now())
    }

    fn get_backend_for_request_at(
        &self,
        headers: &HeaderMap,
        client_addr: SocketAddr,
        pool: &ServerPool,
        now: Instant,
    ) -> Option<SessionHit> {
        let sessions = self.sessions.read();
        let now_ms = self.millis_at(now);

        let usable = |key: &str| -> Option<SessionHit> {
            let session = sessions.get(key)?;
            if !self.is_fresh(session, now_ms) {
                return None;
            }
            if !session.backend.is_alive() || !pool.contains(&session.backend) {
                return None;
            }
            session.last_used.store(now_ms, Ordering::Relaxed);
            Some(SessionHit {
                backend: Arc::clone(&session.backend),
                key: session.token.clone(),
            })
        };

        if let Some(token) = session_cookie(headers) {
            if let Some(hit) = usable(&token) {
                debug!(url = %hit.backend.url(), "Sticky session hit (cookie)");
                return Some(hit);
            }
        }

        let ip = client_ip(headers, client_addr);
        let hit = usable(&ip);
        if let Some(ref hit) = hit {
            debug!(url = %hit.backend.url(), client_ip = %ip, "Sticky session hit (client IP)");
        }
        hit
    }

    /// Bind this client to `backend` and build the cookie announcing it
    pub fn set_session(
        &self,
        headers: &HeaderMap,
        client_addr: SocketAddr,
        backend: &Arc<Backend>,
    ) -> SessionBinding {
        self.set_session_at(headers, client_addr, backend, Instant::now())
    }

    fn set_session_at(
        &self,
        headers: &HeaderMap,
        client_addr: SocketAddr,
        backend: &Arc<Backend>,
        now: Instant,
    ) -> SessionBinding {
        let ip = client_ip(headers, client_addr);
        let user_agent = headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let key = generate_session_key(&ip, user_agent);

        let now_ms = self.millis_at(now);
        let session = Arc::new(Session {
            backend: Arc::clone(backend),
            token: key.clone(),
            last_used: AtomicU64::new(now_ms),
        });

        {
            let mut sessions = self.sessions.write();
            sessions.insert(key.clone(), Arc::clone(&session));
            sessions.insert(ip.clone(), session);
        }

        debug!(url = %backend.url(), client_ip = %ip, "Created sticky session");

        let cookie = format!(
            "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
            SESSION_COOKIE,
            key,
            self.config.ttl.as_secs()
        );
        // The key is hex and the attributes are ASCII, so this cannot fail
        let cookie = HeaderValue::from_str(&cookie)
            .unwrap_or_else(|_| HeaderValue::from_static("proxy_session=; Path=/"));

        SessionBinding { key, cookie }
    }

    /// Drop every session bound to `backend`. Returns the number of keys removed.
    pub fn clear_session_for_backend(&self, backend: &Backend) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, session| session.backend.id() != backend.id());
        let removed = before - sessions.len();

        if removed > 0 {
            info!(url = %backend.url(), removed, "Cleared sticky sessions for backend");
        }
        removed
    }

    /// Remove sessions idle longer than the TTL. Returns the number removed.
    pub fn cleanup_expired(&self) -> usize {
        self.cleanup_expired_at(Instant::now())
    }

    fn cleanup_expired_at(&self, now: Instant) -> usize {
        let now_ms = self.millis_at(now);
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, session| self.is_fresh(session, now_ms));
        let removed = before - sessions.len();

        if removed > 0 {
            info!(removed, remaining = sessions.len(), "Cleaned up expired sessions");
        }
        removed
    }

    /// Start the periodic sweep. Returns false if it was already running.
    pub fn start_cleanup(self: &Arc<Self>) -> bool {
        let mut cleanup = self.cleanup.lock();
        if cleanup.is_some() {
            return false;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let manager = Arc::clone(self);
        let interval = self.config.cleanup_interval;

        let handle = tokio::spawn(async move {
            debug!(interval_secs = interval.as_secs(), "Session cleanup started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        manager.cleanup_expired();
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("Session cleanup stopped");
                            break;
                        }
                    }
                }
            }
        });

        *cleanup = Some(CleanupTask { shutdown_tx, handle });
        true
    }

    /// Stop the periodic sweep. Returns false if it was not running.
    pub async fn stop_cleanup(&self) -> bool {
        let Some(task) = self.cleanup.lock().take() else {
            return false;
        };

        let _ = task.shutdown_tx.send(true);
        if let Err(e) = task.handle.await {
            warn!(error = %e, "Session cleanup task ended abnormally");
        }
        true
    }

    pub fn is_cleanup_running(&self) -> bool {
        self.cleanup.lock().is_some()
    }

    pub fn get_stats(&self) -> SessionStats {
        let now_ms = self.millis_at(Instant::now());
        let sessions = self.sessions.read();
        SessionStats {
            total_sessions: sessions.len(),
            active_sessions: sessions
                .values()
                .filter(|s| self.is_fresh(s, now_ms))
                .count(),
            session_ttl: format!("{:?}", self.config.ttl),
            cleanup_interval: format!("{:?}", self.config.cleanup_interval),
        }
    }

    fn is_fresh(&self, session: &Session, now_ms: u64) -> bool {
        let idle = now_ms.saturating_sub(session.last_used.load(Ordering::Relaxed));
        u128::from(idle) < self.config.ttl.as_millis()
    }

    fn millis_at(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }
}

impl BackendObserver for SessionManager {
    fn backend_down(&self, backend: &Arc<Backend>) {
        self.clear_session_for_backend(backend);
    }
}

/// Client IP: first `X-Forwarded-For` entry, then `X-Real-IP`, then the peer address
pub fn client_ip(headers: &HeaderMap, client_addr: SocketAddr) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(first) = header("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return first.to_string();
    }

    if let Some(real_ip) = header("x-real-ip") {
        return real_ip.to_string();
    }

    client_addr.ip().to_string()
}

/// Value of the `proxy_session` cookie, if the request carries one
pub fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

fn generate_session_key(ip: &str, user_agent: &str) -> String {
    let now = chrono::Utc::now();
    let mut hasher = Sha256::new();
    hasher.update(ip.as_bytes());
    hasher.update(now.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true).as_bytes());
    hasher.update(user_agent.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}
