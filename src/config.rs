use crate::backend::{normalize_url, Backend, DEFAULT_WEIGHT};
use crate::loadbalancer::Strategy;
use crate::pool::ServerPool;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Strategy and sticky-session settings
    #[serde(default)]
    pub balancer: BalancerConfig,

    /// Background health checking
    #[serde(default)]
    pub health_check: HealthCheckSettings,

    /// Backend URLs, in round-robin order
    #[serde(default)]
    pub backends: Vec<String>,

    /// Weights keyed by backend URL (default 1)
    #[serde(default)]
    pub backend_weights: HashMap<String, u32>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Proxy listener port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the admin API (default: 8081)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// When set, POST/DELETE /backends require `Authorization: Bearer <token>`
    pub admin_token: Option<String>,

    /// Upper bound on a single forwarding attempt, in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Limit on reading a client's request headers, idle keep-alive included (default: 10)
    #[serde(default = "default_header_read_timeout")]
    pub header_read_timeout_secs: u64,

    /// Largest request body the proxy buffers for forwarding (default: 10 MiB)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// Serve HTTPS. Without cert/key files a self-signed certificate is generated.
    #[serde(default)]
    pub enable_https: bool,

    /// Path to TLS certificate file (PEM format)
    pub cert_file: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub key_file: Option<String>,
}

impl ServerConfig {
    pub fn has_tls_files(&self) -> bool {
        self.cert_file.is_some() && self.key_file.is_some()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn header_read_timeout(&self) -> Duration {
        Duration::from_secs(self.header_read_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            request_timeout_secs: default_request_timeout(),
            header_read_timeout_secs: default_header_read_timeout(),
            max_body_bytes: default_max_body_bytes(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            pid_file: None,
            enable_https: false,
            cert_file: None,
            key_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BalancerConfig {
    /// `round-robin` (default) or `weighted-round-robin` / `weighted`
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Bind clients to the backend that first served them
    #[serde(default)]
    pub sticky_sessions: bool,

    /// Idle lifetime of a sticky session in seconds (default: 1800)
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,

    /// Expired-session sweep period in seconds (default: 300)
    #[serde(default = "default_session_cleanup_interval")]
    pub session_cleanup_interval_secs: u64,
}

impl BalancerConfig {
    /// Parsed strategy; unknown names fall back to round-robin
    pub fn strategy(&self) -> Strategy {
        match self.strategy.parse() {
            Ok(strategy) => strategy,
            Err(e) => {
                warn!(error = %e, "Falling back to round-robin");
                Strategy::RoundRobin
            }
        }
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn session_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.session_cleanup_interval_secs)
    }
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            sticky_sessions: false,
            session_ttl_secs: default_session_ttl(),
            session_cleanup_interval_secs: default_session_cleanup_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthCheckSettings {
    /// Seconds between health check ticks (default: 10)
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    /// Per-probe timeout in seconds, less than the interval (default: 2)
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,

    /// Path probed on backends configured without one (default: /health)
    #[serde(default = "default_health_path")]
    pub path: String,
}

impl HealthCheckSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
            timeout_secs: default_health_timeout(),
            path: default_health_path(),
        }
    }
}

/// Effective configuration as reported by the admin `/config` endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSnapshot {
    pub port: u16,
    pub strategy: Strategy,
    pub sticky_sessions: bool,
    pub https_enabled: bool,
    /// Current pool membership, including admin changes
    pub backends: Vec<String>,
    pub backend_weights: BTreeMap<String, u32>,
}

impl ConfigSnapshot {
    pub fn new(config: &Config, strategy: Strategy, pool: &ServerPool) -> Self {
        let backends = pool.get_all();
        Self {
            port: config.server.port,
            strategy,
            sticky_sessions: config.balancer.sticky_sessions,
            https_enabled: config.server.enable_https,
            backends: backends.iter().map(|b| b.url().to_string()).collect(),
            backend_weights: backends
                .iter()
                .map(|b| (b.url().to_string(), b.weight()))
                .collect(),
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    8081
}

fn default_request_timeout() -> u64 {
    30
}

fn default_header_read_timeout() -> u64 {
    10
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_strategy() -> String {
    Strategy::RoundRobin.as_str().to_string()
}

fn default_session_ttl() -> u64 {
    30 * 60
}

fn default_session_cleanup_interval() -> u64 {
    5 * 60
}

fn default_health_interval() -> u64 {
    10
}

fn default_health_timeout() -> u64 {
    2
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate numeric settings. Backend URLs are checked by [`Config::backend_entries`].
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.health_check.interval_secs == 0 {
            errors.push("health_check.interval_secs must be greater than 0".to_string());
        }
        if self.health_check.timeout_secs == 0 {
            errors.push("health_check.timeout_secs must be greater than 0".to_string());
        }
        if self.health_check.timeout_secs >= self.health_check.interval_secs {
            errors.push(format!(
                "health_check.timeout_secs ({}) must be less than interval_secs ({})",
                self.health_check.timeout_secs, self.health_check.interval_secs
            ));
        }
        if !self.health_check.path.starts_with('/') {
            errors.push(format!(
                "health_check.path '{}' must start with '/'",
                self.health_check.path
            ));
        }
        if self.balancer.session_ttl_secs == 0 {
            errors.push("balancer.session_ttl_secs must be greater than 0".to_string());
        }
        if self.balancer.session_cleanup_interval_secs == 0 {
            errors.push("balancer.session_cleanup_interval_secs must be greater than 0".to_string());
        }
        if self.server.request_timeout_secs == 0 {
            errors.push("server.request_timeout_secs must be greater than 0".to_string());
        }
        if self.server.header_read_timeout_secs == 0 {
            errors.push("server.header_read_timeout_secs must be greater than 0".to_string());
        }
        if self.server.max_body_bytes == 0 {
            errors.push("server.max_body_bytes must be greater than 0".to_string());
        }
        if self.server.cert_file.is_some() != self.server.key_file.is_some() {
            errors.push("server.cert_file and server.key_file must be set together".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Weight configured for a backend URL, matched as written or normalized
    pub fn weight_for(&self, url: &str) -> u32 {
        if let Some(weight) = self.backend_weights.get(url) {
            return *weight;
        }
        let Ok(key) = normalize_url(url) else {
            return DEFAULT_WEIGHT;
        };
        self.backend_weights
            .iter()
            .find(|(configured, _)| normalize_url(configured).ok().as_deref() == Some(key.as_str()))
            .map(|(_, weight)| *weight)
            .unwrap_or(DEFAULT_WEIGHT)
    }

    /// Build backends from the configured URLs, skipping invalid entries
    pub fn backend_entries(&self) -> Vec<Backend> {
        let mut entries: Vec<Backend> = Vec::with_capacity(self.backends.len());

        for raw in &self.backends {
            let backend = match Backend::new(raw) {
                Ok(backend) => backend,
                Err(e) => {
                    warn!(url = %raw, error = %e, "Skipping invalid backend");
                    continue;
                }
            };
            if entries.iter().any(|b| b.url() == backend.url()) {
                warn!(url = %raw, "Skipping duplicate backend");
                continue;
            }
            let weight = self.weight_for(raw);
            entries.push(backend.with_weight(weight));
        }

        if entries.is_empty() {
            warn!("No valid backends configured; add them through the admin API");
        }
        entries
    }
}
