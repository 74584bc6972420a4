use crate::error::BalansirError;
use crate::pool::ServerPool;
use bytes::Bytes;
use hyper::body::Frame;
use log::debug;
use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;

/// Request-rate and response-time collector, mirrored into a Prometheus
/// registry the same way the in-process counters are kept.
pub struct RateCounter {
    requests_total: AtomicU64,
    average_response_time_ms: AtomicU64,
    registry: Registry,
    prom_requests_total: IntCounter,
    prom_response_time_ms: IntGauge,
    prom_upstreams_alive: IntGauge,
}

impl RateCounter {
    pub fn new() -> Self {
        let registry = Registry::new();

        let prom_requests_total = IntCounter::with_opts(
            Opts::new("requests_total", "Total requests dispatched to upstreams").namespace("balansir"),
        )
        .expect("requests_total metric");
        let prom_response_time_ms = IntGauge::with_opts(
            Opts::new("average_response_time_ms", "Exponential moving average of response time in ms")
                .namespace("balansir"),
        )
        .expect("average_response_time_ms metric");
        let prom_upstreams_alive = IntGauge::with_opts(
            Opts::new("upstreams_alive", "Upstreams currently passing health probes").namespace("balansir"),
        )
        .expect("upstreams_alive metric");

        registry
            .register(Box::new(prom_requests_total.clone()))
            .expect("register requests_total");
        registry
            .register(Box::new(prom_response_time_ms.clone()))
            .expect("register average_response_time_ms");
        registry
            .register(Box::new(prom_upstreams_alive.clone()))
            .expect("register upstreams_alive");

        Self {
            requests_total: AtomicU64::new(0),
            average_response_time_ms: AtomicU64::new(0),
            registry,
            prom_requests_total,
            prom_response_time_ms,
            prom_upstreams_alive,
        }
    }

    pub fn rate_increment(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.prom_requests_total.inc();
    }

    /// Stop a response-time measurement started at `start`, folding it into
    /// an exponential moving average.
    pub fn response_count(&self, start: Instant) {
        let duration_ms = start.elapsed().as_millis() as u64;
        let alpha = 0.1;
        let current = self.average_response_time_ms.load(Ordering::Relaxed);
        let next = (alpha * duration_ms as f64 + (1.0 - alpha) * current as f64) as u64;
        self.average_response_time_ms.store(next, Ordering::Relaxed);
        self.prom_response_time_ms.set(next as i64);
    }

    pub fn set_upstreams_alive(&self, count: usize) {
        self.prom_upstreams_alive.set(count as i64);
    }

    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn average_response_time_ms(&self) -> u64 {
        self.average_response_time_ms.load(Ordering::Relaxed)
    }

    /// Current metrics snapshot in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, BalansirError> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut buffer)
            .map_err(|e| BalansirError::Http(format!("failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| BalansirError::Http(e.to_string()))
    }
}

impl Default for RateCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Records the response time on any exit path of a dispatch.
pub struct ResponseTimer<'a> {
    rate: &'a RateCounter,
    start: Instant,
}

impl<'a> ResponseTimer<'a> {
    pub fn start(rate: &'a RateCounter) -> Self {
        Self { rate, start: Instant::now() }
    }
}

impl Drop for ResponseTimer<'_> {
    fn drop(&mut self) {
        self.rate.response_count(self.start);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EndpointStats {
    pub url: String,
    pub alive: bool,
    pub weight: f64,
    pub active_connections: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    pub timestamp: i64,
    pub total_requests: u64,
    pub requests_per_second: u64,
    pub average_response_time_ms: u64,
    pub endpoints: Vec<EndpointStats>,
}

/// Publishes a stats snapshot once a second onto a watch channel; the SSE
/// handler fans it out to subscribers. Append-only by construction: every
/// snapshot is a fresh value on the channel, nothing is rewritten.
pub async fn publish_loop(
    rate: Arc<RateCounter>,
    pool: Arc<ServerPool>,
    stats_tx: watch::Sender<Stats>,
) {
    let mut last_total = rate.requests_total();

    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let total = rate.requests_total();
        let endpoints: Vec<EndpointStats> = pool
            .snapshot()
            .iter()
            .map(|server| EndpointStats {
                url: server.url.to_string(),
                alive: server.alive(),
                weight: server.weight,
                active_connections: server.active_connections.get(),
            })
            .collect();

        rate.set_upstreams_alive(endpoints.iter().filter(|e| e.alive).count());

        let stats = Stats {
            timestamp: chrono::Utc::now().timestamp(),
            total_requests: total,
            requests_per_second: total.saturating_sub(last_total),
            average_response_time_ms: rate.average_response_time_ms(),
            endpoints,
        };
        last_total = total;

        if stats_tx.send(stats).is_err() {
            debug!("Stats channel closed, stopping metrics publisher");
            return;
        }
    }
}

/// Server-sent-events body streaming serialized stats snapshots.
pub struct StatsStream {
    rx: mpsc::Receiver<Bytes>,
}

impl StatsStream {
    /// Subscribe to the stats channel. A pump task serialises each snapshot
    /// into an SSE frame; it exits when the client disconnects.
    pub fn subscribe(mut stats_rx: watch::Receiver<Stats>) -> Self {
        let (tx, rx) = mpsc::channel(8);

        tokio::spawn(async move {
            loop {
                let stats = stats_rx.borrow_and_update().clone();
                let payload = match serde_json::to_string(&stats) {
                    Ok(json) => format!("data: {}\n\n", json),
                    Err(_) => return,
                };
                if tx.send(Bytes::from(payload)).await.is_err() {
                    return;
                }
                if stats_rx.changed().await.is_err() {
                    return;
                }
            }
        });

        Self { rx }
    }
}

impl hyper::body::Body for StatsStream {
    type Data = Bytes;
    type Error = std::convert::Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.get_mut().rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
