use crate::dispatch::Balansir;
use crate::error::BalansirError;
use crate::metrics::StatsStream;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::{Body, Frame, Incoming};
use hyper::header::{HeaderValue, HOST, LOCATION};
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use log::{debug, error, info};
use rustls::ServerConfig;
use std::convert::Infallible;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::TcpListener;
use tokio::time::Duration;
use tokio_rustls::TlsAcceptor;

const CONTENT_DIR: &str = "content";

/// Response body for the front-end routes: buffered bytes for proxied and
/// static responses, a live stream for the stats channel.
pub enum BalansirBody {
    Full(Full<Bytes>),
    Stream(StatsStream),
}

impl Body for BalansirBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.get_mut() {
            BalansirBody::Full(body) => Pin::new(body).poll_frame(cx),
            BalansirBody::Stream(body) => Pin::new(body).poll_frame(cx),
        }
    }
}

/// Bind the configured front end and serve until shutdown.
pub async fn run(app: Arc<Balansir>) -> Result<(), BalansirError> {
    let (protocol, port, autocert) = {
        let config = app.config.read().unwrap();
        (config.protocol.clone(), config.port, config.autocert)
    };

    if protocol == "https" {
        if autocert {
            run_autocert(app).await
        } else {
            run_tls_static(app).await
        }
    } else {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!("Balansir listening on http://0.0.0.0:{}", port);
        serve_plain(app, listener).await
    }
}

/// Accept loop for a plain-HTTP front end. Public so tests can drive the
/// full pipeline through an ephemeral listener.
pub async fn serve_plain(app: Arc<Balansir>, listener: TcpListener) -> Result<(), BalansirError> {
    loop {
        let (stream, remote) = listener.accept().await?;
        let app = app.clone();
        tokio::spawn(async move {
            serve_connection(app, TokioIo::new(stream), remote).await;
        });
    }
}

async fn serve_connection<I>(app: Arc<Balansir>, io: TokioIo<I>, remote: SocketAddr)
where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let read_timeout = app.config.read().unwrap().read_timeout;

    let service = service_fn(move |req| {
        let app = app.clone();
        async move { Ok::<_, Infallible>(route(&app, req, remote).await) }
    });

    let mut builder = ServerBuilder::new();
    builder.timer(TokioTimer::new());
    builder.header_read_timeout(Duration::from_secs(read_timeout.max(1)));

    if let Err(err) = builder.serve_connection(io, service).await {
        debug!("Error serving connection from {}: {}", remote, err);
    }
}

async fn route(app: &Arc<Balansir>, req: Request<Incoming>, remote: SocketAddr) -> Response<BalansirBody> {
    match req.uri().path() {
        "/balansir/metrics" => metrics_response(app),
        "/balansir/metrics/stats" => stats_response(app),
        path if path.starts_with("/content/") => serve_content(path).await,
        _ => app.handle(req, remote).await.map(BalansirBody::Full),
    }
}

fn metrics_response(app: &Arc<Balansir>) -> Response<BalansirBody> {
    match app.rate.encode() {
        Ok(payload) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
            .body(BalansirBody::Full(Full::new(Bytes::from(payload))))
            .unwrap(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            plain_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
        }
    }
}

fn stats_response(app: &Arc<Balansir>) -> Response<BalansirBody> {
    let stream = StatsStream::subscribe(app.stats_tx.subscribe());
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .body(BalansirBody::Stream(stream))
        .unwrap()
}

async fn serve_content(path: &str) -> Response<BalansirBody> {
    let relative = path.trim_start_matches("/content/");
    if relative.is_empty() || relative.split('/').any(|segment| segment == "..") {
        return plain_response(StatusCode::NOT_FOUND, "Not Found");
    }

    let file_path: PathBuf = Path::new(CONTENT_DIR).join(relative);
    match tokio::fs::read(&file_path).await {
        Ok(contents) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", content_type(&file_path))
            .body(BalansirBody::Full(Full::new(Bytes::from(contents))))
            .unwrap(),
        Err(_) => plain_response(StatusCode::NOT_FOUND, "Not Found"),
    }
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or_default() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "txt" => "text/plain; charset=utf-8",
        "wasm" => "application/wasm",
        _ => "application/octet-stream",
    }
}

fn plain_response(status: StatusCode, body: &str) -> Response<BalansirBody> {
    Response::builder()
        .status(status)
        .body(BalansirBody::Full(Full::new(Bytes::from(body.to_string()))))
        .unwrap()
}

/// HTTPS with statically-provided certificates, plus a companion HTTP
/// listener that 301-redirects to the TLS port.
async fn run_tls_static(app: Arc<Balansir>) -> Result<(), BalansirError> {
    let (port, tls_port, cert_path, key_path) = {
        let config = app.config.read().unwrap();
        (
            config.port,
            config.tls_port,
            config.ssl_certificate.clone(),
            config.ssl_key.clone(),
        )
    };

    let tls_config = create_tls_config(&key_path, &cert_path)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    tokio::spawn(redirect_loop(port, tls_port));

    let listener = TcpListener::bind(("0.0.0.0", tls_port)).await?;
    info!("Balansir listening on https://0.0.0.0:{}", tls_port);

    serve_tls(app, listener, acceptor).await
}

/// HTTPS with certificates managed in `cert_dir` by an external ACME agent.
/// The plain listener answers HTTP-01 challenges from the webroot under
/// `cert_dir` and redirects everything else; TLS is restricted to the
/// configured host whitelist.
async fn run_autocert(app: Arc<Balansir>) -> Result<(), BalansirError> {
    let (port, tls_port, cert_dir) = {
        let config = app.config.read().unwrap();
        (config.port, config.tls_port, config.cert_dir.clone())
    };

    let cert_path = format!("{}/fullchain.pem", cert_dir);
    let key_path = format!("{}/privkey.pem", cert_dir);
    let tls_config = create_tls_config(&key_path, &cert_path)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    tokio::spawn(challenge_loop(port, tls_port, cert_dir));

    let listener = TcpListener::bind(("0.0.0.0", tls_port)).await?;
    info!("Balansir listening on https://0.0.0.0:{} (autocert)", tls_port);

    serve_tls(app, listener, acceptor).await
}

async fn serve_tls(
    app: Arc<Balansir>,
    listener: TcpListener,
    acceptor: TlsAcceptor,
) -> Result<(), BalansirError> {
    let white_hosts = app.config.read().unwrap().white_hosts.clone();

    loop {
        let (stream, remote) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let app = app.clone();
        let white_hosts = white_hosts.clone();

        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    if white_hosts.is_empty() {
                        serve_connection(app, TokioIo::new(tls_stream), remote).await;
                    } else {
                        serve_whitelisted(app, TokioIo::new(tls_stream), remote, white_hosts).await;
                    }
                }
                Err(e) => debug!("TLS handshake failed from {}: {}", remote, e),
            }
        });
    }
}

async fn serve_whitelisted<I>(
    app: Arc<Balansir>,
    io: TokioIo<I>,
    remote: SocketAddr,
    white_hosts: Vec<String>,
) where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let app = app.clone();
        let white_hosts = white_hosts.clone();
        async move {
            let host = request_host(&req).unwrap_or_default();
            if !white_hosts.iter().any(|allowed| allowed.eq_ignore_ascii_case(&host)) {
                return Ok::<_, Infallible>(plain_response(StatusCode::FORBIDDEN, "Host not allowed"));
            }
            Ok(route(&app, req, remote).await)
        }
    });

    let mut builder = ServerBuilder::new();
    builder.timer(TokioTimer::new());

    if let Err(err) = builder.serve_connection(io, service).await {
        debug!("Error serving connection from {}: {}", remote, err);
    }
}

/// Companion plain listener for the static-cert mode: 301 to HTTPS.
async fn redirect_loop(port: u16, tls_port: u16) {
    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Cannot bind HTTP redirect listener on :{}: {}", port, e);
            return;
        }
    };

    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!("Redirect listener accept failed: {}", e);
                continue;
            }
        };

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| async move {
                Ok::<_, Infallible>(redirect_response(&req, tls_port))
            });
            if let Err(err) = ServerBuilder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("Error serving redirect from {}: {}", remote, err);
            }
        });
    }
}

/// Companion plain listener for the autocert mode: answers HTTP-01
/// challenges from the webroot, redirects everything else.
async fn challenge_loop(port: u16, tls_port: u16, cert_dir: String) {
    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Cannot bind ACME challenge listener on :{}: {}", port, e);
            return;
        }
    };

    let webroot = Arc::new(format!("{}/webroot", cert_dir));

    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!("Challenge listener accept failed: {}", e);
                continue;
            }
        };

        let webroot = webroot.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let webroot = webroot.clone();
                async move {
                    let path = req.uri().path();
                    if let Some(token) = path.strip_prefix("/.well-known/acme-challenge/") {
                        if !token.is_empty() && !token.contains('/') && !token.contains("..") {
                            let file = format!("{}/.well-known/acme-challenge/{}", webroot, token);
                            if let Ok(contents) = tokio::fs::read(&file).await {
                                return Ok::<_, Infallible>(
                                    Response::builder()
                                        .status(StatusCode::OK)
                                        .body(BalansirBody::Full(Full::new(Bytes::from(contents))))
                                        .unwrap(),
                                );
                            }
                        }
                        return Ok(plain_response(StatusCode::NOT_FOUND, "Not Found"));
                    }
                    Ok(redirect_response(&req, tls_port))
                }
            });
            if let Err(err) = ServerBuilder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("Error serving challenge from {}: {}", remote, err);
            }
        });
    }
}

fn redirect_response(req: &Request<Incoming>, tls_port: u16) -> Response<BalansirBody> {
    let host = request_host(req).unwrap_or_else(|| "localhost".to_string());
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let location = format!("https://{}:{}{}", host, tls_port, path_and_query);

    let mut response = plain_response(StatusCode::MOVED_PERMANENTLY, "");
    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(LOCATION, value);
    }
    response
}

fn request_host(req: &Request<Incoming>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(|host| host.split(':').next().unwrap_or(host).to_string())
}

fn create_tls_config(key_path: &str, cert_path: &str) -> Result<ServerConfig, BalansirError> {
    let mut key_reader = BufReader::new(
        File::open(key_path)
            .map_err(|e| BalansirError::Tls(format!("failed to open private key file: {}", e)))?,
    );
    let mut cert_reader = BufReader::new(
        File::open(cert_path)
            .map_err(|e| BalansirError::Tls(format!("failed to open certificate file: {}", e)))?,
    );

    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| BalansirError::Tls(format!("failed to read certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(BalansirError::Tls("no valid certificate found".to_string()));
    }

    let private_key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| BalansirError::Tls(format!("failed to read private key: {}", e)))?
        .ok_or_else(|| BalansirError::Tls("no valid private key found".to_string()))?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, private_key)
        .map_err(|e| BalansirError::Tls(format!("failed to create TLS config: {}", e)))
}
