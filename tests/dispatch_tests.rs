//! End-to-end pipeline tests: real backends on ephemeral ports, a real
//! front-end listener, and a pooled client driving the whole dispatch path.

use balansir::{listener, reload, Balansir, Configuration};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{COOKIE, SET_COOKIE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

type TestClient = Client<HttpConnector, Full<Bytes>>;

/// Backend answering every request with `name`, counting hits, optionally
/// sleeping to keep requests in flight.
async fn spawn_backend(name: &'static str, hits: Arc<AtomicUsize>, delay: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            let hits = hits.clone();
            tokio::spawn(async move {
                let service = service_fn(move |_req: Request<Incoming>| {
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(name))))
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

/// Backend echoing the request's X-Forwarded-For header back in the body.
async fn spawn_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let forwarded = req
                        .headers()
                        .get("x-forwarded-for")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("none")
                        .to_string();
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(forwarded))))
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

fn config_json(servers: &[SocketAddr], extra: &str) -> String {
    let server_list: Vec<String> = servers
        .iter()
        .map(|addr| format!(r#"{{"url": "{}", "weight": 0.5}}"#, addr))
        .collect();
    format!(
        r#"{{"algorithm": "round-robin", "server_list": [{}]{}{}}}"#,
        server_list.join(","),
        if extra.is_empty() { "" } else { "," },
        extra
    )
}

async fn spawn_balansir(config: Configuration) -> (Arc<Balansir>, SocketAddr) {
    let app = Balansir::new(config).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let serving = app.clone();
    tokio::spawn(async move {
        let _ = listener::serve_plain(serving, listener).await;
    });

    (app, addr)
}

fn client() -> TestClient {
    Client::builder(TokioExecutor::new()).build_http()
}

async fn get(client: &TestClient, addr: SocketAddr, path: &str) -> (StatusCode, Bytes) {
    let req = Request::builder()
        .uri(format!("http://{}{}", addr, path))
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = client.request(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}

#[tokio::test]
async fn round_robin_distributes_in_order() {
    let hits = Arc::new(AtomicUsize::new(0));
    let a = spawn_backend("A", hits.clone(), Duration::ZERO).await;
    let b = spawn_backend("B", hits.clone(), Duration::ZERO).await;
    let c = spawn_backend("C", hits.clone(), Duration::ZERO).await;

    let config = Configuration::from_slice(config_json(&[a, b, c], "").as_bytes()).unwrap();
    let (_app, addr) = spawn_balansir(config).await;
    let client = client();

    let mut bodies = Vec::new();
    for _ in 0..6 {
        let (status, body) = get(&client, addr, "/").await;
        assert_eq!(status, StatusCode::OK);
        bodies.push(String::from_utf8(body.to_vec()).unwrap());
    }
    assert_eq!(bodies, vec!["A", "B", "C", "A", "B", "C"]);
}

#[tokio::test]
async fn cache_hit_skips_the_upstream() {
    let hits = Arc::new(AtomicUsize::new(0));
    let backend = spawn_backend("hello", hits.clone(), Duration::ZERO).await;

    let extra = r#""cache": true, "cache_rules": [{"path": "/api/", "ttl": 60}]"#;
    let config = Configuration::from_slice(config_json(&[backend], extra).as_bytes()).unwrap();
    let (_app, addr) = spawn_balansir(config).await;
    let client = client();

    let (status, first) = get(&client, addr, "/api/x").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&first[..], b"hello");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let (status, second) = get(&client, addr, "/api/x").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first, second);
    assert_eq!(hits.load(Ordering::SeqCst), 1, "cache hit must not contact the upstream");
}

#[tokio::test]
async fn uncached_paths_always_reach_the_upstream() {
    let hits = Arc::new(AtomicUsize::new(0));
    let backend = spawn_backend("hello", hits.clone(), Duration::ZERO).await;

    let extra = r#""cache": true, "cache_rules": [{"path": "/api/", "ttl": 60}]"#;
    let config = Configuration::from_slice(config_json(&[backend], extra).as_bytes()).unwrap();
    let (_app, addr) = spawn_balansir(config).await;
    let client = client();

    get(&client, addr, "/other").await;
    get(&client, addr, "/other").await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn rate_limit_rejects_burst_overflow_with_429() {
    let hits = Arc::new(AtomicUsize::new(0));
    let backend = spawn_backend("ok", hits.clone(), Duration::ZERO).await;

    let extra = r#""rate_limit": true, "rate_per_second": 2, "rate_burst": 2"#;
    let config = Configuration::from_slice(config_json(&[backend], extra).as_bytes()).unwrap();
    let (_app, addr) = spawn_balansir(config).await;
    let client = client();

    let (first, _) = get(&client, addr, "/").await;
    let (second, _) = get(&client, addr, "/").await;
    let (third, body) = get(&client, addr, "/").await;

    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::OK);
    assert_eq!(third, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(&body[..], b"Too Many Requests");
    assert_eq!(hits.load(Ordering::SeqCst), 2, "rejected request must not reach an upstream");
}

#[tokio::test]
async fn all_dead_pool_returns_500() {
    let hits = Arc::new(AtomicUsize::new(0));
    let backend = spawn_backend("ok", hits.clone(), Duration::ZERO).await;

    let config = Configuration::from_slice(config_json(&[backend], "").as_bytes()).unwrap();
    let (app, addr) = spawn_balansir(config).await;

    for upstream in app.pool.snapshot() {
        upstream.set_alive(false);
    }

    let client = client();
    let (status, _) = get(&client, addr, "/").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn session_cookie_pins_to_one_upstream() {
    let hits = Arc::new(AtomicUsize::new(0));
    let a = spawn_backend("A", hits.clone(), Duration::ZERO).await;
    let b = spawn_backend("B", hits.clone(), Duration::ZERO).await;

    let extra = r#""session_persistence": true"#;
    let config = Configuration::from_slice(config_json(&[a, b], extra).as_bytes()).unwrap();
    let (_app, addr) = spawn_balansir(config).await;
    let client = client();

    let req = Request::builder()
        .uri(format!("http://{}/", addr))
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = client.request(req).await.unwrap();
    let cookie = response
        .headers()
        .get(SET_COOKIE)
        .expect("selection must set the session cookie")
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string();
    let pinned = response.into_body().collect().await.unwrap().to_bytes();

    for _ in 0..10 {
        let req = Request::builder()
            .uri(format!("http://{}/", addr))
            .header(COOKIE, cookie.clone())
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = client.request(req).await.unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, pinned, "cookie-bearing requests must pin to one upstream");
    }
}

#[tokio::test]
async fn stale_session_cookie_falls_back_to_selection() {
    let hits = Arc::new(AtomicUsize::new(0));
    let backend = spawn_backend("A", hits.clone(), Duration::ZERO).await;

    let extra = r#""session_persistence": true"#;
    let config = Configuration::from_slice(config_json(&[backend], extra).as_bytes()).unwrap();
    let (_app, addr) = spawn_balansir(config).await;
    let client = client();

    let req = Request::builder()
        .uri(format!("http://{}/", addr))
        .header(COOKIE, "_balansir_server_hash=deadbeef")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = client.request(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"A");
}

#[tokio::test]
async fn transparent_mode_annotates_client_address() {
    let backend = spawn_echo_backend().await;

    let extra = r#""transparent_proxy_mode": true"#;
    let config = Configuration::from_slice(config_json(&[backend], extra).as_bytes()).unwrap();
    let (_app, addr) = spawn_balansir(config).await;
    let client = client();

    let (status, body) = get(&client, addr, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"127.0.0.1");
}

#[tokio::test]
async fn gzip_response_compresses_when_client_accepts() {
    let hits = Arc::new(AtomicUsize::new(0));
    let backend = spawn_backend("hello hello hello hello", hits.clone(), Duration::ZERO).await;

    let extra = r#""gzip_response": true"#;
    let config = Configuration::from_slice(config_json(&[backend], extra).as_bytes()).unwrap();
    let (_app, addr) = spawn_balansir(config).await;
    let client = client();

    let req = Request::builder()
        .uri(format!("http://{}/", addr))
        .header("Accept-Encoding", "gzip")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = client.request(req).await.unwrap();
    assert_eq!(
        response.headers().get("content-encoding").unwrap(),
        "gzip"
    );

    let compressed = response.into_body().collect().await.unwrap().to_bytes();
    let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
    let mut decoded = String::new();
    std::io::Read::read_to_string(&mut decoder, &mut decoded).unwrap();
    assert_eq!(decoded, "hello hello hello hello");
}

#[tokio::test]
async fn upstream_dial_failure_returns_502() {
    // Nothing listens on this address; liveness has not been probed yet, so
    // dispatch still forwards and the error hook answers 502.
    let dead: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let config = Configuration::from_slice(config_json(&[dead], "").as_bytes()).unwrap();
    let (_app, addr) = spawn_balansir(config).await;
    let client = client();

    let (status, _) = get(&client, addr, "/").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn reload_swaps_generation_without_dropping_requests() {
    let a_hits = Arc::new(AtomicUsize::new(0));
    let b_hits = Arc::new(AtomicUsize::new(0));
    let c_hits = Arc::new(AtomicUsize::new(0));
    let a = spawn_backend("A", a_hits.clone(), Duration::ZERO).await;
    let b = spawn_backend("B", b_hits.clone(), Duration::from_millis(300)).await;
    let c = spawn_backend("C", c_hits.clone(), Duration::ZERO).await;

    let config = Configuration::from_slice(config_json(&[a, b], "").as_bytes()).unwrap();
    let (app, addr) = spawn_balansir(config).await;

    // A batch of overlapping requests against the old generation, half of
    // them held open by the slow backend.
    let mut in_flight = Vec::new();
    for _ in 0..20 {
        let client = client();
        in_flight.push(tokio::spawn(async move {
            get(&client, addr, "/").await
        }));
    }

    // Every request must have reached a backend (and therefore entered the
    // barrier) before the reload starts.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while a_hits.load(Ordering::SeqCst) + b_hits.load(Ordering::SeqCst) < 20 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "in-flight requests did not start in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let new_config = config_json(&[a, c], "");
    reload::apply_configuration(&app, new_config.as_bytes())
        .await
        .expect("reload should apply");

    for request in in_flight {
        let (status, body) = request.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert!(
            body == Bytes::from("A") || body == Bytes::from("B"),
            "old-generation request hit an unexpected upstream: {:?}",
            body
        );
    }

    let b_after_reload = b_hits.load(Ordering::SeqCst);
    let client = client();
    for _ in 0..10 {
        let (status, body) = get(&client, addr, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(
            body == Bytes::from("A") || body == Bytes::from("C"),
            "new-generation request hit an unexpected upstream: {:?}",
            body
        );
    }
    assert_eq!(
        b_hits.load(Ordering::SeqCst),
        b_after_reload,
        "no request issued after the reload may reach the retired upstream"
    );
    assert!(
        c_hits.load(Ordering::SeqCst) > 0,
        "the new generation must actually receive traffic"
    );
}

#[tokio::test]
async fn reload_with_identical_servers_keeps_the_generation() {
    let hits = Arc::new(AtomicUsize::new(0));
    let backend = spawn_backend("A", hits.clone(), Duration::ZERO).await;

    let json = config_json(&[backend], "");
    let config = Configuration::from_slice(json.as_bytes()).unwrap();
    let (app, _addr) = spawn_balansir(config).await;

    let before = Arc::as_ptr(&app.pool.snapshot()[0]);

    // Same (url, weight) set with a changed scalar: scalars swap, pool stays.
    let scalar_change = config_json(&[backend], r#""delay": 42"#);
    reload::apply_configuration(&app, scalar_change.as_bytes())
        .await
        .unwrap();

    let after = Arc::as_ptr(&app.pool.snapshot()[0]);
    assert_eq!(before, after, "unchanged (url, weight) set must not rebuild the pool");
    assert_eq!(app.config.read().unwrap().delay, 42);
}

#[tokio::test]
async fn config_watcher_applies_file_changes() {
    let hits = Arc::new(AtomicUsize::new(0));
    let backend = spawn_backend("A", hits.clone(), Duration::ZERO).await;

    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, config_json(&[backend], "")).unwrap();

    let config = Configuration::from_file(&path).unwrap();
    let (app, _addr) = spawn_balansir(config).await;
    tokio::spawn(reload::watch_loop(app.clone(), path.clone()));

    // Let the watcher take its baseline fingerprint before changing the file.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    std::fs::write(&path, config_json(&[backend], r#""delay": 42"#)).unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if app.config.read().unwrap().delay == 42 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "watcher did not apply the configuration change"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn invalid_reload_is_refused_and_old_pool_retained() {
    let hits = Arc::new(AtomicUsize::new(0));
    let backend = spawn_backend("A", hits.clone(), Duration::ZERO).await;

    let config = Configuration::from_slice(config_json(&[backend], "").as_bytes()).unwrap();
    let (app, addr) = spawn_balansir(config).await;

    let bad = r#"{"algorithm": "weighted-round-robin",
                  "server_list": [{"url": "127.0.0.1:9000", "weight": 7.0}]}"#;
    assert!(reload::apply_configuration(&app, bad.as_bytes()).await.is_err());

    let client = client();
    let (status, body) = get(&client, addr, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"A");
}
