use crate::barrier::ReloadBarrier;
use crate::config::Configuration;
use crate::error::BalansirError;
use crate::upstream::Upstream;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::time::Duration;

/// Ordered set of upstreams for one pool generation, plus the rotating
/// round-robin cursor. Selection always observes a single generation: the
/// reload barrier keeps `rebuild` from racing any reader.
pub struct ServerPool {
    servers: RwLock<Vec<Arc<Upstream>>>,
    cursor: AtomicUsize,
}

impl ServerPool {
    pub fn new() -> Self {
        Self {
            servers: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Replace the whole generation. Callers hold the reload barrier.
    pub fn rebuild(&self, servers: Vec<Arc<Upstream>>) {
        let mut guard = self.servers.write().unwrap();
        *guard = servers;
        self.cursor.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Vec<Arc<Upstream>> {
        self.servers.read().unwrap().clone()
    }

    /// Upstreams with liveness true, in pool order.
    pub fn alive_servers(&self) -> Vec<Arc<Upstream>> {
        self.servers
            .read()
            .unwrap()
            .iter()
            .filter(|s| s.alive())
            .cloned()
            .collect()
    }

    /// Advance the cursor modulo the number of currently alive upstreams.
    /// The cursor moves exactly once per call; ties fall to pool order.
    pub fn next_round_robin(&self) -> Option<Arc<Upstream>> {
        let alive = self.alive_servers();
        if alive.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % alive.len();
        Some(alive[index].clone())
    }

    /// Weighted random pick: draw r uniformly from [0, Σw) and return the
    /// first upstream whose running sum crosses r.
    pub fn weighted_choice(&self) -> Result<Arc<Upstream>, BalansirError> {
        let alive: Vec<Arc<Upstream>> = self
            .alive_servers()
            .into_iter()
            .filter(|s| s.weight > 0.0)
            .collect();

        let total: f64 = alive.iter().map(|s| s.weight).sum();
        if total <= 0.0 {
            return Err(BalansirError::NoServersAvailable);
        }

        let mut r = rand::thread_rng().gen_range(0.0..total);
        for server in &alive {
            r -= server.weight;
            if r < 0.0 {
                return Ok(server.clone());
            }
        }

        // Floating-point residue can leave r at ~0 after the last element.
        alive.last().cloned().ok_or(BalansirError::NoServersAvailable)
    }

    /// Alive upstream with the smallest active-connection counter, ties
    /// broken by pool index.
    pub fn least_connected(&self) -> Option<Arc<Upstream>> {
        self.alive_servers()
            .into_iter()
            .reduce(|best, candidate| {
                if candidate.active_connections.get() < best.active_connections.get() {
                    candidate
                } else {
                    best
                }
            })
    }

    /// Alive upstream minimising active_connections / weight; zero-weight
    /// upstreams are excluded.
    pub fn weighted_least_connected(&self) -> Option<Arc<Upstream>> {
        self.alive_servers()
            .into_iter()
            .filter(|s| s.weight > 0.0)
            .reduce(|best, candidate| {
                let best_load = best.active_connections.get() / best.weight;
                let candidate_load = candidate.active_connections.get() / candidate.weight;
                if candidate_load < best_load {
                    candidate
                } else {
                    best
                }
            })
    }

    /// Look up an upstream by its session hash. Only alive upstreams of the
    /// current generation qualify; anything else means the cookie is stale
    /// and the caller falls back to normal selection.
    pub fn server_by_hash(&self, hash: &str) -> Option<Arc<Upstream>> {
        if hash.is_empty() {
            return None;
        }
        self.servers
            .read()
            .unwrap()
            .iter()
            .find(|s| s.server_hash == hash && s.alive())
            .cloned()
    }
}

impl Default for ServerPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Health-check driver: probes every upstream at the configured interval.
/// Each tick first waits on the reload barrier so it never probes a stale
/// generation.
pub async fn health_check_loop(
    pool: Arc<ServerPool>,
    barrier: Arc<ReloadBarrier>,
    config: Arc<RwLock<Configuration>>,
) {
    loop {
        let (delay, timeout) = {
            let config = config.read().unwrap();
            (config.delay, config.timeout)
        };
        tokio::time::sleep(Duration::from_secs(delay.max(1))).await;

        barrier.wait_until_clear().await;

        let servers = pool.snapshot();
        for server in servers {
            server.check_alive(Duration::from_secs(timeout.max(1))).await;
        }
    }
}
