use thiserror::Error;

#[derive(Error, Debug)]
pub enum BalansirError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("URI error: {0}")]
    Uri(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("No servers available")]
    NoServersAvailable,

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("TLS error: {0}")]
    Tls(String),
}
