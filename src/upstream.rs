use crate::forwarder::Forwarder;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tokio::time::Duration;
use url::Url;

/// Floating-point counter supporting concurrent increment and decrement,
/// stored as IEEE-754 bits in an atomic word.
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn add(&self, delta: f64) {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + delta).to_bits();
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

/// One upstream endpoint within a pool generation.
///
/// The URL and weight never change in place; a reload that alters them
/// replaces the pool wholesale. Liveness is written only by the health-check
/// driver and read by selection.
pub struct Upstream {
    pub url: Url,
    pub weight: f64,
    pub index: usize,
    alive: RwLock<bool>,
    pub active_connections: AtomicF64,
    /// hex MD5 of the URL string when session persistence is enabled,
    /// otherwise empty.
    pub server_hash: String,
    pub proxy: Forwarder,
}

impl Upstream {
    pub fn new(url: Url, weight: f64, index: usize, server_hash: String, proxy: Forwarder) -> Self {
        Self {
            url,
            weight,
            index,
            alive: RwLock::new(true),
            active_connections: AtomicF64::new(0.0),
            server_hash,
            proxy,
        }
    }

    pub fn alive(&self) -> bool {
        *self.alive.read().unwrap()
    }

    pub fn set_alive(&self, status: bool) {
        *self.alive.write().unwrap() = status;
    }

    fn probe_target(&self) -> (String, u16) {
        let host = self.url.host_str().unwrap_or_default().to_string();
        let port = self.url.port_or_known_default().unwrap_or(80);
        (host, port)
    }

    /// One TCP liveness probe against `host:port` with the given timeout.
    pub async fn check_alive(&self, timeout: Duration) {
        let (host, port) = self.probe_target();
        let dial = tokio::net::TcpStream::connect((host.as_str(), port));

        match tokio::time::timeout(timeout, dial).await {
            Ok(Ok(_stream)) => {
                if !self.alive() {
                    info!("Server is up: {}:{}", host, port);
                }
                self.set_alive(true);
            }
            Ok(Err(e)) => {
                if self.alive() {
                    warn!("Server is down: {}:{} ({})", host, port, e);
                }
                self.set_alive(false);
            }
            Err(_) => {
                if self.alive() {
                    warn!("Server is down: {}:{} (dial timeout)", host, port);
                }
                debug!("Health probe timed out for {}:{}", host, port);
                self.set_alive(false);
            }
        }
    }
}

/// RAII wrapper pairing the increment and decrement around a proxied call,
/// including error paths.
pub struct ConnectionGuard<'a> {
    upstream: &'a Upstream,
}

impl<'a> ConnectionGuard<'a> {
    pub fn new(upstream: &'a Upstream) -> Self {
        upstream.active_connections.add(1.0);
        Self { upstream }
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.upstream.active_connections.add(-1.0);
    }
}
