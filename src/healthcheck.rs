//! Health check system for backends
//!
//! Periodically probes every backend in the pool and updates liveness through
//! the balancer, so transitions are logged and sticky sessions invalidated the
//! same way as when the request path detects a failure.

use crate::backend::Backend;
use crate::loadbalancer::LoadBalancer;
use crate::upstream::UpstreamClient;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Health check configuration
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Interval between health checks
    pub interval: Duration,
    /// Timeout for each probe, always shorter than the interval
    pub timeout: Duration,
    /// Path probed on backends whose URL carries no path of its own
    pub path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
            path: "/health".to_string(),
        }
    }
}

/// Snapshot served by the admin `/health` endpoint
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckStats {
    pub health_check_interval: String,
    pub total_backends: usize,
    pub alive_backends: usize,
    /// Time this report was produced
    pub last_check: DateTime<Utc>,
    /// Completion time of the most recent tick, if any has run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_completed_tick: Option<DateTime<Utc>>,
}

struct RunningTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Background prober for every backend in the balancer's pool
pub struct HealthChecker {
    balancer: Arc<dyn LoadBalancer>,
    upstream: Arc<UpstreamClient>,
    config: HealthCheckConfig,
    task: Mutex<Option<RunningTask>>,
    last_tick: RwLock<Option<DateTime<Utc>>>,
}

impl HealthChecker {
    /// Create a checker. A zero interval falls back to the default, and a
    /// timeout that is not strictly shorter than the interval is cut to half
    /// of it.
    pub fn new(
        balancer: Arc<dyn LoadBalancer>,
        upstream: Arc<UpstreamClient>,
        mut config: HealthCheckConfig,
    ) -> Self {
        if config.interval.is_zero() {
            warn!("Health check interval is zero, using the default");
            config.interval = HealthCheckConfig::default().interval;
        }
        if config.timeout >= config.interval {
            let clamped = config.interval / 2;
            warn!(
                timeout_ms = config.timeout.as_millis() as u64,
                interval_ms = config.interval.as_millis() as u64,
                clamped_ms = clamped.as_millis() as u64,
                "Health check timeout not below interval, clamping"
            );
            config.timeout = clamped;
        }

        Self {
            balancer,
            upstream,
            config,
            task: Mutex::new(None),
            last_tick: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Start ticking. Returns false if the checker was already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut task = self.task.lock();
        if task.is_some() {
            return false;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let checker = Arc::clone(self);
        let interval = self.config.interval;

        let handle = tokio::spawn(async move {
            info!(
                interval_secs = interval.as_secs(),
                timeout_ms = checker.config.timeout.as_millis() as u64,
                "Health checker started"
            );

            // Fixed period, first tick one interval after start
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        checker.check_all_backends().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("Health checker stopped");
                            break;
                        }
                    }
                }
            }
        });

        *task = Some(RunningTask { shutdown_tx, handle });
        true
    }

    /// Stop ticking and wait for an in-progress tick to finish.
    /// Returns false if the checker was not running.
    pub async fn stop(&self) -> bool {
        let Some(task) = self.task.lock().take() else {
            return false;
        };

        let _ = task.shutdown_tx.send(true);
        if let Err(e) = task.handle.await {
            warn!(error = %e, "Health checker task ended abnormally");
        }
        true
    }

    /// Probe every backend concurrently and record the results
    pub async fn check_all_backends(&self) {
        let backends = self.balancer.pool().get_all();
        let before_alive = backends.iter().filter(|b| b.is_alive()).count();

        let probes = backends.iter().map(|backend| async move {
            let alive = self.probe_backend(backend).await;
            (backend, alive)
        });
        let results = futures::future::join_all(probes).await;

        for (backend, alive) in &results {
            self.balancer.set_backend_status(backend.url(), *alive);
        }

        let after_alive = self.balancer.pool().count_alive();
        *self.last_tick.write() = Some(Utc::now());

        debug!(checked = results.len(), alive = after_alive, "Health check complete");
        if before_alive != after_alive {
            info!(
                before = before_alive,
                after = after_alive,
                "Alive backend count changed"
            );
        }
    }

    /// URL probed for `backend`
    pub fn probe_uri(&self, backend: &Backend) -> String {
        if backend.has_path() {
            backend.url().to_string()
        } else {
            backend.target_uri(&self.config.path)
        }
    }

    async fn probe_backend(&self, backend: &Backend) -> bool {
        let uri = self.probe_uri(backend);
        match self.upstream.probe(&uri, self.config.timeout).await {
            Some(status) if status.as_u16() <= 499 => true,
            Some(status) => {
                debug!(url = %backend.url(), status = status.as_u16(), "Health probe returned server error");
                false
            }
            None => false,
        }
    }

    pub fn get_health_check_stats(&self) -> HealthCheckStats {
        let pool = self.balancer.pool();
        HealthCheckStats {
            health_check_interval: format!("{:?}", self.config.interval),
            total_backends: pool.count(),
            alive_backends: pool.count_alive(),
            last_check: Utc::now(),
            last_completed_tick: *self.last_tick.read(),
        }
    }
}
