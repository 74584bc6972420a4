use crate::cache::CacheCluster;
use crate::config::Configuration;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, VARY};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioTimer};
use log::{debug, error};
use std::io::Write;
use std::sync::Arc;
use tokio::time::Duration;
use url::Url;

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Owned forwarding handle of one upstream: rewrites the request for the
/// target and carries a pooled client whose connect and keep-alive timeouts
/// come from configuration (`write_timeout` and `read_timeout`, the names are
/// historical).
pub struct Forwarder {
    target: Url,
    client: Client<HttpConnector, Incoming>,
}

impl Forwarder {
    pub fn new(target: Url, connect_timeout_secs: u64, keepalive_secs: u64) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(connect_timeout_secs)));
        connector.set_keepalive(Some(Duration::from_secs(keepalive_secs)));
        connector.set_nodelay(true);

        let mut builder = Client::builder(TokioExecutor::new());
        builder.pool_max_idle_per_host(100);
        builder.pool_idle_timeout(Duration::from_secs(keepalive_secs));
        builder.pool_timer(TokioTimer::new());

        Self {
            target,
            client: builder.build(connector),
        }
    }

    /// Forward one request to the upstream. Dial and read failures become a
    /// 502 towards the client; they are never fatal to the pipeline and the
    /// upstream stays alive until the next health probe proves otherwise.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        client_ip: Option<&str>,
        config: &Configuration,
        cache: Option<&Arc<CacheCluster>>,
    ) -> Response<Full<Bytes>> {
        let path = req.uri().path().to_string();
        let accepts_gzip = accepts_gzip(req.headers());

        let prepared = match self.rewrite_request(req, client_ip) {
            Ok(request) => request,
            Err(reason) => {
                error!("Failed to rewrite request for {}: {}", self.target, reason);
                return bad_gateway(&reason);
            }
        };

        let response = match self.client.request(prepared).await {
            Ok(response) => response,
            Err(e) => {
                error!("Upstream {} request failed: {}", self.target, e);
                return bad_gateway(&e.to_string());
            }
        };

        let (mut parts, body) = response.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                error!("Failed to read upstream {} response body: {}", self.target, e);
                return bad_gateway(&e.to_string());
            }
        };

        strip_hop_headers(&mut parts.headers);

        if config.cache {
            if let Some(cache) = cache {
                cache.store_response(&path, &parts.headers, &body, &config.cache_rules);
            }
        }

        let body = if config.gzip_response && accepts_gzip {
            gzip_body(&mut parts.headers, body)
        } else {
            body
        };

        if let Ok(len) = HeaderValue::from_str(&body.len().to_string()) {
            parts.headers.insert(CONTENT_LENGTH, len);
        }

        Response::from_parts(parts, Full::new(body))
    }

    fn rewrite_request(
        &self,
        mut req: Request<Incoming>,
        client_ip: Option<&str>,
    ) -> Result<Request<Incoming>, String> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let target_uri: Uri = format!(
            "{}{}",
            self.target.as_str().trim_end_matches('/'),
            path_and_query
        )
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| e.to_string())?;

        *req.uri_mut() = target_uri;

        let headers = req.headers_mut();
        strip_hop_headers(headers);

        if let Some(ip) = client_ip {
            if let Ok(value) = HeaderValue::from_str(ip) {
                headers.insert(X_FORWARDED_FOR.clone(), value);
            }
        }

        Ok(req)
    }
}

fn strip_hop_headers(headers: &mut HeaderMap) {
    headers.remove("Connection");
    headers.remove("Upgrade");
    headers.remove("Keep-Alive");
    headers.remove("Proxy-Authenticate");
    headers.remove("Proxy-Authorization");
    headers.remove("TE");
    headers.remove("Trailers");
    headers.remove("Transfer-Encoding");
}

fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|token| token.trim().starts_with("gzip")))
        .unwrap_or(false)
}

fn gzip_body(headers: &mut HeaderMap, body: Bytes) -> Bytes {
    if body.is_empty() || headers.contains_key(CONTENT_ENCODING) {
        return body;
    }

    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), Compression::default());
    if encoder.write_all(&body).is_err() {
        debug!("Gzip encoding failed, serving identity response");
        return body;
    }

    match encoder.finish() {
        Ok(compressed) => {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
            headers.append(VARY, HeaderValue::from_static("Accept-Encoding"));
            Bytes::from(compressed)
        }
        Err(_) => {
            debug!("Gzip encoding failed, serving identity response");
            body
        }
    }
}

fn bad_gateway(message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(Full::new(Bytes::from(format!("Proxy Error: {}", message))))
        .unwrap()
}
