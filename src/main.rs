use balansir::{cache, listener, metrics, pool, rate_limit, reload, Balansir, Configuration};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::time::Duration;

#[derive(Parser)]
#[clap(
    version = "1.0.0",
    about = "Reverse-proxy load balancer with response caching, rate limiting and hot config reload"
)]
struct Args {
    #[clap(
        short,
        long,
        value_name = "FILE",
        default_value = "config.json",
        help = "Configuration file path"
    )]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let configuration = Configuration::from_file(&args.config)?;
    let app = Balansir::new(configuration)?;

    {
        let config = app.config.read().unwrap();
        info!(
            "Starting Balansir with {} endpoints ({:?})",
            config.server_list.len(),
            config.algorithm
        );
    }

    tokio::spawn(pool::health_check_loop(
        app.pool.clone(),
        app.barrier.clone(),
        app.config.clone(),
    ));
    tokio::spawn(reload::watch_loop(app.clone(), args.config.clone()));
    tokio::spawn(metrics::publish_loop(
        app.rate.clone(),
        app.pool.clone(),
        app.stats_tx.clone(),
    ));

    {
        let config = app.config.read().unwrap();
        if config.rate_limit {
            tokio::spawn(rate_limit::cleanup_loop(app.limiter.clone()));
        }
        if config.cache_background_update {
            if let Some(cluster) = app.cache.clone() {
                tokio::spawn(cache::background_sweep_loop(cluster, Duration::from_secs(30)));
                info!("Cache enabled with background sweeping");
            }
        } else if app.cache.is_some() {
            info!("Cache enabled");
        }
    }

    let server = tokio::spawn(listener::run(Arc::clone(&app)));

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        result = server => {
            match result {
                Ok(Err(e)) => eprintln!("Server error: {}", e),
                Err(e) => eprintln!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    Ok(())
}
