use crate::config::{CacheRule, Configuration};
use crate::error::BalansirError;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH};
use hyper::Response;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Serialised cache record: response headers as an ordered list of
/// `(key, values)` pairs plus the body bytes.
#[derive(Debug, Serialize, Deserialize)]
pub struct CachedResponse {
    pub headers: Vec<CachedHeader>,
    pub body: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CachedHeader {
    pub key: String,
    pub value: Vec<String>,
}

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
    last_used: Instant,
    hits: u64,
}

#[derive(Default)]
struct Shard {
    entries: HashMap<String, Entry>,
    used_bytes: usize,
}

#[derive(Clone, Copy, PartialEq)]
enum Eviction {
    Lru,
    Lfu,
}

/// Sharded response cache. Each shard is an independently locked map with a
/// byte budget; eviction inside a full shard follows the configured
/// algorithm (`lru` or `lfu`), and `exceed_fallback` lets a write spill to
/// the emptiest other shard instead of failing.
pub struct CacheCluster {
    shards: Vec<Mutex<Shard>>,
    shard_max_bytes: usize,
    eviction: Eviction,
    exceed_fallback: bool,
}

impl CacheCluster {
    pub fn new(config: &Configuration) -> Self {
        let shards_amount = config.cache_shards_amount.max(1);
        let eviction = if config.cache_algorithm.eq_ignore_ascii_case("lfu") {
            Eviction::Lfu
        } else {
            Eviction::Lru
        };

        Self {
            shards: (0..shards_amount).map(|_| Mutex::new(Shard::default())).collect(),
            shard_max_bytes: config.cache_shard_max_size_mb.max(1) * 1024 * 1024,
            eviction,
            exceed_fallback: config.cache_shard_exceed_fallback,
        }
    }

    fn shard_index(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut shard = self.shards[self.shard_index(key)].lock().unwrap();
        let now = Instant::now();

        let expired = match shard.entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.last_used = now;
                entry.hits += 1;
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            if let Some(stale) = shard.entries.remove(key) {
                shard.used_bytes -= stale.value.len();
            }
        }
        None
    }

    pub fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), BalansirError> {
        let primary = self.shard_index(key);
        if self.try_set(primary, key, &value, ttl) {
            return Ok(());
        }

        if self.exceed_fallback {
            for index in 0..self.shards.len() {
                if index != primary && self.try_set(index, key, &value, ttl) {
                    return Ok(());
                }
            }
        }

        Err(BalansirError::Cache(format!(
            "value of {} bytes exceeds shard capacity",
            value.len()
        )))
    }

    fn try_set(&self, index: usize, key: &str, value: &[u8], ttl: Duration) -> bool {
        if value.len() > self.shard_max_bytes {
            return false;
        }

        let mut shard = self.shards[index].lock().unwrap();
        if let Some(previous) = shard.entries.remove(key) {
            shard.used_bytes -= previous.value.len();
        }

        while shard.used_bytes + value.len() > self.shard_max_bytes {
            if !evict_one(&mut shard, self.eviction) {
                return false;
            }
        }

        let now = Instant::now();
        shard.used_bytes += value.len();
        shard.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: now + ttl,
                last_used: now,
                hits: 0,
            },
        );
        true
    }

    /// Drop every expired entry. Driven by the background sweeper task.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap();
            let expired: Vec<String> = shard
                .entries
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .map(|(key, _)| key.clone())
                .collect();
            for key in expired {
                if let Some(entry) = shard.entries.remove(&key) {
                    shard.used_bytes -= entry.value.len();
                }
            }
        }
    }

    /// Response-pipeline hook: capture an eligible upstream response into the
    /// cache. The body has already been buffered by the forwarder, so the
    /// downstream write is unaffected. Write failures are logged, not fatal.
    pub fn store_response(
        &self,
        path: &str,
        headers: &HeaderMap,
        body: &[u8],
        rules: &[CacheRule],
    ) {
        let ttl = match matching_rule(path, rules) {
            Some(ttl) => ttl,
            None => return,
        };

        // No double-store: an existing live entry wins.
        if self.get(path).is_some() {
            return;
        }

        let record = CachedResponse {
            headers: collect_headers(headers),
            body: body.to_vec(),
        };

        let serialized = match serde_json::to_vec(&record) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to serialize cache record for {}: {}", path, e);
                return;
            }
        };

        if let Err(e) = self.set(path, serialized, ttl) {
            warn!("Failed to cache response for {}: {}", path, e);
        } else {
            debug!("Cached response for {} ({} bytes)", path, body.len());
        }
    }

    /// Rebuild a response from a serialised cache record and hand it to the
    /// client, bypassing upstreams entirely.
    pub fn serve_from_cache(cached: &[u8]) -> Result<Response<Full<Bytes>>, BalansirError> {
        let record: CachedResponse = serde_json::from_slice(cached)
            .map_err(|e| BalansirError::Cache(format!("malformed cache record: {}", e)))?;

        let mut builder = Response::builder();
        if let Some(headers) = builder.headers_mut() {
            for header in &record.headers {
                let name = match HeaderName::from_bytes(header.key.as_bytes()) {
                    Ok(name) => name,
                    Err(_) => continue,
                };
                for value in &header.value {
                    if let Ok(value) = HeaderValue::from_str(value) {
                        headers.append(name.clone(), value);
                    }
                }
            }
            if let Ok(len) = HeaderValue::from_str(&record.body.len().to_string()) {
                headers.insert(CONTENT_LENGTH, len);
            }
        }

        builder
            .body(Full::new(Bytes::from(record.body)))
            .map_err(|e| BalansirError::Http(e.to_string()))
    }
}

/// A request path is cacheable iff some rule's prefix matches it; the first
/// matching rule supplies the TTL.
pub fn matching_rule(path: &str, rules: &[CacheRule]) -> Option<Duration> {
    rules
        .iter()
        .find(|rule| path.starts_with(&rule.path))
        .map(|rule| Duration::from_secs(rule.ttl))
}

fn collect_headers(headers: &HeaderMap) -> Vec<CachedHeader> {
    let mut out: Vec<CachedHeader> = Vec::new();
    for (name, value) in headers {
        let value = match value.to_str() {
            Ok(v) => v.to_string(),
            Err(_) => continue,
        };
        match out.iter_mut().find(|h| h.key == name.as_str()) {
            Some(existing) => existing.value.push(value),
            None => out.push(CachedHeader {
                key: name.as_str().to_string(),
                value: vec![value],
            }),
        }
    }
    out
}

fn evict_one(shard: &mut Shard, eviction: Eviction) -> bool {
    let now = Instant::now();

    // Expired entries go first regardless of algorithm.
    let victim = shard
        .entries
        .iter()
        .find(|(_, entry)| entry.expires_at <= now)
        .map(|(key, _)| key.clone())
        .or_else(|| {
            let mut entries: Vec<(&String, &Entry)> = shard.entries.iter().collect();
            match eviction {
                Eviction::Lru => entries.sort_by_key(|(_, e)| e.last_used),
                Eviction::Lfu => entries.sort_by_key(|(_, e)| e.hits),
            }
            entries.first().map(|(key, _)| (*key).clone())
        });

    match victim {
        Some(key) => {
            if let Some(entry) = shard.entries.remove(&key) {
                shard.used_bytes -= entry.value.len();
            }
            true
        }
        None => false,
    }
}

/// Periodically evicts expired entries so idle shards release memory.
pub async fn background_sweep_loop(cache: Arc<CacheCluster>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        cache.sweep_expired();
    }
}
