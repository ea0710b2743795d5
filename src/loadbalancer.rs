//! Load balancing strategies
//!
//! Both strategies select from the shared [`ServerPool`] and implement the
//! [`LoadBalancer`] trait, which is all the proxy handler, health checker and
//! admin API depend on. Liveness changes go through
//! [`LoadBalancer::set_backend_status`] no matter who detected them, so
//! transition logging and observer notification (sticky-session
//! invalidation) behave the same for health probes and failed forwards.

use crate::backend::Backend;
use crate::pool::ServerPool;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Load balancing strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Visit backends in a fixed rotating order
    #[default]
    RoundRobin,
    /// Pick backends with probability proportional to their weight
    WeightedRoundRobin,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round-robin",
            Strategy::WeightedRoundRobin => "weighted-round-robin",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round-robin" | "roundrobin" | "rr" => Ok(Strategy::RoundRobin),
            "weighted-round-robin" | "weighted" | "wrr" => Ok(Strategy::WeightedRoundRobin),
            other => Err(format!("unknown load balancing strategy '{}'", other)),
        }
    }
}

/// Notified when a backend transitions from alive to dead
pub trait BackendObserver: Send + Sync {
    fn backend_down(&self, backend: &Arc<Backend>);
}

/// Per-backend entry of a status report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendStatus {
    pub url: String,
    pub alive: bool,
    pub current_connections: usize,
    pub weight: u32,
}

/// Point-in-time report of a balancer and its pool
#[derive(Debug, Clone, Serialize)]
pub struct BalancerStatus {
    pub total_backends: usize,
    pub alive_backends: usize,
    pub strategy: Strategy,
    pub current_counter: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_weight: Option<u64>,
    pub backends: Vec<BackendStatus>,
}

/// Capability shared by every strategy
pub trait LoadBalancer: Send + Sync {
    fn strategy(&self) -> Strategy;

    fn pool(&self) -> &Arc<ServerPool>;

    /// Select the backend for the next request, or `None` if nothing is alive
    fn get_next_valid_peer(&self) -> Option<Arc<Backend>>;

    /// Register a backend; `None` if its URL is already in the pool
    fn add_backend(&self, backend: Backend) -> Option<Arc<Backend>>;

    /// Unregister a backend by URL; `false` if it was not registered
    fn remove_backend(&self, url: &str) -> bool;

    /// Record a liveness result for the backend registered under `url`
    fn set_backend_status(&self, url: &str, alive: bool);

    fn get_status(&self) -> BalancerStatus;

    /// Subscribe to alive-to-dead transitions
    fn add_observer(&self, observer: Arc<dyn BackendObserver>);
}

/// Build the balancer for a strategy over a shared pool
pub fn build_balancer(strategy: Strategy, pool: Arc<ServerPool>) -> Arc<dyn LoadBalancer> {
    match strategy {
        Strategy::RoundRobin => Arc::new(RoundRobinBalancer::new(pool)),
        Strategy::WeightedRoundRobin => Arc::new(WeightedRoundRobinBalancer::new(pool)),
    }
}

/// State and bookkeeping common to both strategies
struct BalancerCore {
    pool: Arc<ServerPool>,
    observers: RwLock<Vec<Arc<dyn BackendObserver>>>,
}

impl BalancerCore {
    fn new(pool: Arc<ServerPool>) -> Self {
        Self {
            pool,
            observers: RwLock::new(Vec::new()),
        }
    }

    fn add_backend(&self, backend: Backend, strategy: Strategy) -> Option<Arc<Backend>> {
        let url = backend.url().to_string();
        match self.pool.add(backend) {
            Some(added) => {
                info!(
                    url = %added.url(),
                    weight = added.weight(),
                    %strategy,
                    total_backends = self.pool.count(),
                    "Added backend"
                );
                Some(added)
            }
            None => {
                debug!(url, "Backend already registered");
                None
            }
        }
    }

    fn remove_backend(&self, url: &str) -> bool {
        match self.pool.remove(url) {
            Some(removed) => {
                info!(
                    url = %removed.url(),
                    in_flight = removed.current_connections(),
                    total_backends = self.pool.count(),
                    "Removed backend"
                );
                true
            }
            None => false,
        }
    }

    /// Returns true if the backend's liveness actually changed
    fn set_backend_status(&self, url: &str, alive: bool) -> bool {
        let Some(backend) = self.pool.get_by_url(url) else {
            debug!(url, "Cannot update status: backend not found");
            return false;
        };

        let was_alive = backend.set_alive(alive);
        if was_alive == alive {
            return false;
        }

        if alive {
            info!(url = %backend.url(), weight = backend.weight(), "Backend is now UP");
        } else {
            warn!(
                url = %backend.url(),
                weight = backend.weight(),
                in_flight = backend.current_connections(),
                "Backend is now DOWN"
            );
            let observers = self.observers.read().clone();
            for observer in observers {
                observer.backend_down(&backend);
            }
        }
        true
    }

    fn status(&self, strategy: Strategy, total_weight: Option<u64>) -> BalancerStatus {
        let backends: Vec<BackendStatus> = self
            .pool
            .get_all()
            .iter()
            .map(|b| BackendStatus {
                url: b.url().to_string(),
                alive: b.is_alive(),
                current_connections: b.current_connections(),
                weight: b.weight(),
            })
            .collect();

        BalancerStatus {
            total_backends: backends.len(),
            alive_backends: backends.iter().filter(|b| b.alive).count(),
            strategy,
            current_counter: self.pool.current_cursor(),
            total_weight,
            backends,
        }
    }

    fn add_observer(&self, observer: Arc<dyn BackendObserver>) {
        self.observers.write().push(observer);
    }
}

/// Cyclic selection over the pool's shared cursor
pub struct RoundRobinBalancer {
    core: BalancerCore,
}

impl RoundRobinBalancer {
    pub fn new(pool: Arc<ServerPool>) -> Self {
        Self {
            core: BalancerCore::new(pool),
        }
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn strategy(&self) -> Strategy {
        Strategy::RoundRobin
    }

    fn pool(&self) -> &Arc<ServerPool> {
        &self.core.pool
    }

    fn get_next_valid_peer(&self) -> Option<Arc<Backend>> {
        let backends = self.core.pool.get_all();
        if backends.is_empty() {
            return None;
        }

        // At most one full sweep: every attempt advances the shared cursor,
        // so concurrent callers interleave without revisiting an index early.
        let total = backends.len() as u64;
        for _ in 0..total {
            let cursor = self.core.pool.advance_cursor();
            let index = (cursor.wrapping_sub(1) % total) as usize;
            let backend = &backends[index];
            if backend.is_alive() {
                debug!(url = %backend.url(), cursor, "Selected backend (round-robin)");
                return Some(Arc::clone(backend));
            }
        }

        debug!(total_backends = backends.len(), "No alive backend after a full sweep");
        None
    }

    fn add_backend(&self, backend: Backend) -> Option<Arc<Backend>> {
        self.core.add_backend(backend, self.strategy())
    }

    fn remove_backend(&self, url: &str) -> bool {
        self.core.remove_backend(url)
    }

    fn set_backend_status(&self, url: &str, alive: bool) {
        self.core.set_backend_status(url, alive);
    }

    fn get_status(&self) -> BalancerStatus {
        self.core.status(self.strategy(), None)
    }

    fn add_observer(&self, observer: Arc<dyn BackendObserver>) {
        self.core.add_observer(observer);
    }
}

/// Proportional random selection by backend weight
pub struct WeightedRoundRobinBalancer {
    core: BalancerCore,
    /// Sum of alive weights as of the last membership or liveness change
    total_weight: AtomicU64,
}

impl WeightedRoundRobinBalancer {
    pub fn new(pool: Arc<ServerPool>) -> Self {
        let balancer = Self {
            core: BalancerCore::new(pool),
            total_weight: AtomicU64::new(0),
        };
        balancer.refresh_total_weight();
        balancer
    }

    /// Cached alive weight; selection recomputes it from live state
    pub fn total_weight(&self) -> u64 {
        self.total_weight.load(Ordering::Relaxed)
    }

    fn refresh_total_weight(&self) {
        let total = self
            .core
            .pool
            .get_all()
            .iter()
            .filter(|b| b.is_alive())
            .map(|b| u64::from(b.weight()))
            .sum();
        self.total_weight.store(total, Ordering::Relaxed);
    }
}

/// Weighted draw over `candidates`, all assumed alive.
///
/// Weight-0 candidates are never drawn unless every weight is 0, in which
/// case the choice is uniform.
pub fn select_weighted<R: Rng + ?Sized>(
    candidates: &[Arc<Backend>],
    rng: &mut R,
) -> Option<Arc<Backend>> {
    if candidates.is_empty() {
        return None;
    }

    let weights: Vec<u64> = candidates.iter().map(|b| u64::from(b.weight())).collect();
    let total: u64 = weights.iter().sum();

    if total == 0 {
        return candidates.choose(rng).cloned();
    }

    let draw = rng.gen_range(0..total);
    let mut cumulative = 0u64;
    for (backend, weight) in candidates.iter().zip(&weights) {
        cumulative += weight;
        if draw < cumulative {
            return Some(Arc::clone(backend));
        }
    }

    candidates.first().cloned()
}

impl LoadBalancer for WeightedRoundRobinBalancer {
    fn strategy(&self) -> Strategy {
        Strategy::WeightedRoundRobin
    }

    fn pool(&self) -> &Arc<ServerPool> {
        &self.core.pool
    }

    fn get_next_valid_peer(&self) -> Option<Arc<Backend>> {
        let alive: Vec<Arc<Backend>> = self
            .core
            .pool
            .get_all()
            .into_iter()
            .filter(|b| b.is_alive())
            .collect();

        let selected = select_weighted(&alive, &mut rand::thread_rng());
        if let Some(ref backend) = selected {
            debug!(url = %backend.url(), weight = backend.weight(), "Selected backend (weighted)");
        }
        selected
    }

    fn add_backend(&self, backend: Backend) -> Option<Arc<Backend>> {
        let added = self.core.add_backend(backend, self.strategy());
        if added.is_some() {
            self.refresh_total_weight();
        }
        added
    }

    fn remove_backend(&self, url: &str) -> bool {
        let removed = self.core.remove_backend(url);
        if removed {
            self.refresh_total_weight();
        }
        removed
    }

    fn set_backend_status(&self, url: &str, alive: bool) {
        if self.core.set_backend_status(url, alive) {
            self.refresh_total_weight();
        }
    }

    fn get_status(&self) -> BalancerStatus {
        self.core.status(self.strategy(), Some(self.total_weight()))
    }

    fn add_observer(&self, observer: Arc<dyn BackendObserver>) {
        self.core.add_observer(observer);
    }
}
