use crate::error::BalansirError;
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_protocol() -> String {
    "http".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_tls_port() -> u16 {
    8443
}

fn default_delay() -> u64 {
    5
}

fn default_timeout() -> u64 {
    2
}

fn default_read_timeout() -> u64 {
    15
}

fn default_write_timeout() -> u64 {
    15
}

fn default_cache_shards_amount() -> usize {
    8
}

fn default_cache_shard_max_size_mb() -> usize {
    8
}

fn default_cache_algorithm() -> String {
    "lru".to_string()
}

fn default_rate_per_second() -> u64 {
    100
}

fn default_cert_dir() -> String {
    "certs".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    #[serde(rename = "round-robin")]
    RoundRobin,
    #[serde(rename = "weighted-round-robin")]
    WeightedRoundRobin,
    #[serde(rename = "least-connections")]
    LeastConnections,
    #[serde(rename = "weighted-least-connections")]
    WeightedLeastConnections,
}

impl Algorithm {
    pub fn is_weighted(&self) -> bool {
        matches!(self, Algorithm::WeightedRoundRobin | Algorithm::WeightedLeastConnections)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub url: String,
    #[serde(default)]
    pub weight: f64,
}

/// Path-prefix to TTL mapping deciding cache eligibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRule {
    pub path: String,
    pub ttl: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_tls_port")]
    pub tls_port: u16,
    pub algorithm: Algorithm,
    pub server_list: Vec<ServerEntry>,

    /// Health-probe interval, seconds.
    #[serde(default = "default_delay")]
    pub delay: u64,
    /// Health-probe dial timeout, seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout: u64,

    #[serde(default)]
    pub session_persistence: bool,
    #[serde(default)]
    pub gzip_response: bool,
    #[serde(default)]
    pub transparent_proxy_mode: bool,

    #[serde(default)]
    pub cache: bool,
    #[serde(default = "default_cache_shards_amount")]
    pub cache_shards_amount: usize,
    #[serde(default = "default_cache_shard_max_size_mb")]
    pub cache_shard_max_size_mb: usize,
    #[serde(default)]
    pub cache_shard_exceed_fallback: bool,
    #[serde(default = "default_cache_algorithm")]
    pub cache_algorithm: String,
    #[serde(default)]
    pub cache_background_update: bool,
    #[serde(default)]
    pub cache_rules: Vec<CacheRule>,

    #[serde(default)]
    pub rate_limit: bool,
    #[serde(default = "default_rate_per_second")]
    pub rate_per_second: u64,
    #[serde(default)]
    pub rate_burst: Option<u64>,

    #[serde(default)]
    pub autocert: bool,
    #[serde(default)]
    pub white_hosts: Vec<String>,
    #[serde(default = "default_cert_dir")]
    pub cert_dir: String,
    #[serde(default)]
    pub ssl_certificate: String,
    #[serde(default)]
    pub ssl_key: String,
}

impl Configuration {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, BalansirError> {
        let bytes = std::fs::read(path)?;
        Self::from_slice(&bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, BalansirError> {
        let config: Configuration = serde_json::from_slice(bytes)
            .map_err(|e| BalansirError::Config(format!("failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BalansirError> {
        if self.protocol != "http" && self.protocol != "https" {
            return Err(BalansirError::Config(format!(
                "unsupported protocol \"{}\", expected \"http\" or \"https\"",
                self.protocol
            )));
        }

        if self.server_list.is_empty() {
            return Err(BalansirError::Config(
                "config[\"server_list\"] must contain at least one endpoint".to_string(),
            ));
        }

        if self.algorithm.is_weighted() {
            for server in &self.server_list {
                if server.weight < 0.0 {
                    return Err(BalansirError::Config(format!(
                        "negative weight ({}) is specified for ({}) endpoint in config[\"server_list\"]; \
                         set the weight to 0 to mark it as administratively excluded",
                        server.weight, server.url
                    )));
                }
                if server.weight > 1.0 {
                    return Err(BalansirError::Config(format!(
                        "weight can't be greater than 1; ({}) weight is specified for ({}) endpoint \
                         in config[\"server_list\"]",
                        server.weight, server.url
                    )));
                }
            }

            if self.server_list.iter().all(|s| s.weight == 0.0) {
                return Err(BalansirError::Config(
                    "0 weight is specified for all endpoints in config[\"server_list\"]; \
                     at least one endpoint must carry a non-zero weight"
                        .to_string(),
                ));
            }
        }

        if self.protocol == "https" && !self.autocert {
            if self.ssl_certificate.is_empty() || self.ssl_key.is_empty() {
                return Err(BalansirError::Config(
                    "https without autocert requires ssl_certificate and ssl_key".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Fingerprint of the `(url, weight)` pairs. Two configurations with the
    /// same fingerprint describe the same pool generation, so a reload only
    /// swaps scalar settings.
    pub fn server_pool_fingerprint(&self) -> String {
        let mut joined = String::new();
        for server in &self.server_list {
            joined.push_str(server.url.trim());
            joined.push(':');
            joined.push_str(&server.weight.to_string());
            joined.push(';');
        }
        format!("{:x}", md5::compute(joined.as_bytes()))
    }
}

/// Fingerprint of the raw configuration file, used by the watcher to detect
/// changes without re-parsing every poll.
pub fn file_fingerprint(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}
