mod bus;
mod cache;
mod config;
mod listener;
mod registry;
mod store;
mod web;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::bus::{MemoryBus, MessageBus};
use crate::cache::ArtifactCache;
use crate::config::Config;
use crate::listener::Listener;
use crate::registry::DeaPool;
use crate::store::{BlobStoreClient, ObjectStore};
use crate::web::AppState;

#[derive(Debug, Parser)]
struct Args {
    /// Path to the TOML configuration file; defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = match args.config {
        Some(path) => Config::from_file(&path)?,
        None => Config::default(),
    };

    // The transport behind the MessageBus seam is deployment-specific;
    // the in-process bus serves single-node runs.
    let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new());

    let pool = Arc::new(DeaPool::new(Duration::from_secs(
        cfg.registry.node_timeout_secs,
    )));
    pool.clone().start(bus.clone()).await?;

    let droplets = Arc::new(ArtifactCache::from_config("droplet", &cfg.droplet));
    let packages = Arc::new(ArtifactCache::from_config("package", &cfg.package));
    let buildpacks = Arc::new(ArtifactCache::from_config("buildpack cache", &cfg.buildpack));

    let droplet_store: Arc<dyn ObjectStore> =
        Arc::new(BlobStoreClient::new(&cfg.store, &cfg.store.droplet_bucket)?);
    let package_store: Arc<dyn ObjectStore> = Arc::new(BlobStoreClient::new(
        &cfg.store,
        &cfg.store.app_package_bucket,
    )?);

    let listener = Arc::new(Listener::new(
        droplets.clone(),
        packages.clone(),
        buildpacks.clone(),
        droplet_store.clone(),
        package_store.clone(),
    ));
    listener.clone().start(bus.clone()).await?;
    listener.spawn_sweep_loops([
        (droplets.clone(), Duration::from_secs(cfg.droplet.cache_interval_secs)),
        (packages.clone(), Duration::from_secs(cfg.package.cache_interval_secs)),
        (buildpacks.clone(), Duration::from_secs(cfg.buildpack.cache_interval_secs)),
    ]);

    let state = AppState {
        pool,
        droplets,
        packages,
        buildpacks,
        droplet_store,
        package_store,
    };
    let app = web::create_app(state, cfg.http.max_upload_mb);

    let addr = format!("0.0.0.0:{}", cfg.http.port);
    // A failed bind is the one fatal error: propagate for a nonzero exit.
    let tcp = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "scheduler listening");
    axum::serve(tcp, app).await?;

    Ok(())
}
