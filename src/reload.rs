use crate::config::{file_fingerprint, Configuration};
use crate::dispatch::Balansir;
use crate::error::BalansirError;
use crate::forwarder::Forwarder;
use crate::upstream::Upstream;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;
use url::Url;

/// Build the upstream records for one pool generation from a configuration
/// record. URLs inherit the front-end protocol; the session hash is the hex
/// MD5 of the URL string when pinning is enabled.
pub fn build_upstreams(config: &Configuration) -> Result<Vec<Arc<Upstream>>, BalansirError> {
    let mut upstreams = Vec::with_capacity(config.server_list.len());

    for (index, server) in config.server_list.iter().enumerate() {
        let raw = format!("{}://{}", config.protocol, server.url.trim());
        let url = Url::parse(&raw)?;

        let server_hash = if config.session_persistence {
            format!("{:x}", md5::compute(url.as_str().as_bytes()))
        } else {
            String::new()
        };

        // Historical naming: the upstream dialer's connect timeout comes from
        // write_timeout and its keep-alive from read_timeout.
        let proxy = Forwarder::new(url.clone(), config.write_timeout, config.read_timeout);

        upstreams.push(Arc::new(Upstream::new(
            url,
            server.weight,
            index,
            server_hash,
            proxy,
        )));
    }

    Ok(upstreams)
}

/// Apply a new configuration under the reload barrier. The pool is rebuilt
/// only when the `(url, weight)` set changed; otherwise only scalar settings
/// are swapped. An invalid configuration is refused and the old pool
/// retained.
pub async fn apply_configuration(app: &Balansir, bytes: &[u8]) -> Result<(), BalansirError> {
    let new_config = Configuration::from_slice(bytes)?;

    let _reload = app.barrier.begin_reload().await;

    let fingerprint = new_config.server_pool_fingerprint();
    {
        let mut stored = app.pool_fingerprint.lock().unwrap();
        if *stored != fingerprint {
            let upstreams = build_upstreams(&new_config)?;
            app.pool.rebuild(upstreams);
            *stored = fingerprint;
            info!(
                "Server pool rebuilt with {} endpoints",
                new_config.server_list.len()
            );
        }
    }

    *app.config.write().unwrap() = new_config;
    Ok(())
}

/// Poll the configuration file every second and apply it when its MD5
/// changes. A reload with identical file contents is a no-op.
pub async fn watch_loop(app: Arc<Balansir>, path: PathBuf) {
    let mut current = match tokio::fs::read(&path).await {
        Ok(bytes) => file_fingerprint(&bytes),
        Err(e) => {
            warn!("Cannot read configuration file {}: {}", path.display(), e);
            String::new()
        }
    };

    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(_) => continue,
        };

        let next = file_fingerprint(&bytes);
        if next == current {
            continue;
        }
        current = next;

        match apply_configuration(&app, &bytes).await {
            Ok(()) => info!("Configuration file changes applied to Balansir"),
            Err(e) => error!("Configuration reload refused, keeping old pool: {}", e),
        }
    }
}
