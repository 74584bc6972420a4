use crate::barrier::ReloadBarrier;
use crate::cache::CacheCluster;
use crate::config::{Algorithm, Configuration};
use crate::error::BalansirError;
use crate::metrics::{RateCounter, ResponseTimer, Stats};
use crate::pool::ServerPool;
use crate::rate_limit::RateLimiter;
use crate::reload;
use crate::upstream::{ConnectionGuard, Upstream};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, COOKIE, SET_COOKIE};
use hyper::{Request, Response, StatusCode};
use log::{error, warn};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;

pub const SESSION_COOKIE: &str = "_balansir_server_hash";

/// Shared state of the balancer: the pool and its reload barrier, the
/// configuration record, and the collaborators consulted by dispatch.
pub struct Balansir {
    pub pool: Arc<ServerPool>,
    pub barrier: Arc<ReloadBarrier>,
    pub config: Arc<RwLock<Configuration>>,
    pub cache: Option<Arc<CacheCluster>>,
    pub limiter: Arc<RateLimiter>,
    pub rate: Arc<RateCounter>,
    pub stats_tx: watch::Sender<Stats>,
    pub(crate) pool_fingerprint: Mutex<String>,
}

impl Balansir {
    pub fn new(config: Configuration) -> Result<Arc<Self>, BalansirError> {
        config.validate()?;

        let pool = Arc::new(ServerPool::new());
        pool.rebuild(reload::build_upstreams(&config)?);

        let cache = if config.cache {
            Some(Arc::new(CacheCluster::new(&config)))
        } else {
            None
        };

        let limiter = Arc::new(RateLimiter::new(config.rate_per_second, config.rate_burst));
        let (stats_tx, _stats_rx) = watch::channel(Stats::default());
        let fingerprint = config.server_pool_fingerprint();

        Ok(Arc::new(Self {
            pool,
            barrier: Arc::new(ReloadBarrier::new()),
            config: Arc::new(RwLock::new(config)),
            cache,
            limiter,
            rate: Arc::new(RateCounter::new()),
            stats_tx,
            pool_fingerprint: Mutex::new(fingerprint),
        }))
    }

    /// The per-request pipeline. Ordering is load-bearing: a cache hit never
    /// touches upstreams or the limiter, and a rate-limited request never
    /// reaches selection.
    pub async fn handle(&self, req: Request<Incoming>, remote: SocketAddr) -> Response<Full<Bytes>> {
        let _in_flight = self.barrier.enter_request().await;
        let config = self.config.read().unwrap().clone();

        if config.cache {
            if let Some(cache) = &self.cache {
                if let Some(cached) = cache.get(&req.uri().to_string()) {
                    match CacheCluster::serve_from_cache(&cached) {
                        Ok(response) => return response,
                        Err(e) => warn!("Discarding unreadable cache entry: {}", e),
                    }
                }
            }
        }

        if config.rate_limit {
            let ip = remote.ip().to_string();
            if !self.limiter.allow(&ip) {
                return status_response(StatusCode::TOO_MANY_REQUESTS, "Too Many Requests");
            }
        }

        if self.pool.alive_servers().is_empty() {
            return status_response(StatusCode::INTERNAL_SERVER_ERROR, "");
        }

        self.rate.rate_increment();
        let _timer = ResponseTimer::start(&self.rate);

        let client_ip = if config.transparent_proxy_mode {
            Some(remote.ip().to_string())
        } else {
            None
        };

        if config.session_persistence {
            if let Some(hash) = session_cookie(req.headers()) {
                if let Some(endpoint) = self.pool.server_by_hash(&hash) {
                    return self.serve(endpoint, req, client_ip.as_deref(), &config, false).await;
                }
                // Unknown or dead hash: the cookie is treated as missing and
                // normal selection proceeds.
            }
        }

        let endpoint = match self.select(&config) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                error!("Selection failed: {}", e);
                return status_response(StatusCode::INTERNAL_SERVER_ERROR, "");
            }
        };

        self.serve(endpoint, req, client_ip.as_deref(), &config, config.session_persistence)
            .await
    }

    fn select(&self, config: &Configuration) -> Result<Arc<Upstream>, BalansirError> {
        match config.algorithm {
            Algorithm::RoundRobin => {
                self.pool.next_round_robin().ok_or(BalansirError::NoServersAvailable)
            }
            Algorithm::WeightedRoundRobin => self.pool.weighted_choice(),
            Algorithm::LeastConnections => {
                self.pool.least_connected().ok_or(BalansirError::NoServersAvailable)
            }
            Algorithm::WeightedLeastConnections => self
                .pool
                .weighted_least_connected()
                .ok_or(BalansirError::NoServersAvailable),
        }
    }

    async fn serve(
        &self,
        endpoint: Arc<Upstream>,
        req: Request<Incoming>,
        client_ip: Option<&str>,
        config: &Configuration,
        set_cookie: bool,
    ) -> Response<Full<Bytes>> {
        let counted = matches!(
            config.algorithm,
            Algorithm::LeastConnections | Algorithm::WeightedLeastConnections
        );

        let mut response = if counted {
            let _connection = ConnectionGuard::new(&endpoint);
            endpoint.proxy.forward(req, client_ip, config, self.cache.as_ref()).await
        } else {
            endpoint.proxy.forward(req, client_ip, config, self.cache.as_ref()).await
        };

        // An upstream built while pinning was disabled carries no hash and is
        // treated as non-pinned for this request.
        if set_cookie && !endpoint.server_hash.is_empty() {
            let cookie = format!("{}={}; Path=/", SESSION_COOKIE, endpoint.server_hash);
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                response.headers_mut().append(SET_COOKIE, value);
            }
        }

        response
    }
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    for value in headers.get_all(COOKIE) {
        if let Ok(raw) = value.to_str() {
            for pair in raw.split(';') {
                let mut parts = pair.trim().splitn(2, '=');
                if parts.next() == Some(SESSION_COOKIE) {
                    if let Some(hash) = parts.next() {
                        return Some(hash.to_string());
                    }
                }
            }
        }
    }
    None
}

fn status_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}
