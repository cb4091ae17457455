use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use common::{
    deserialize_message, StagingSuccessMsg, APP_DELETED_SUBJECT, STAGING_SUCCESS_SUBJECT,
};

use crate::bus::MessageBus;
use crate::cache::ArtifactCache;
use crate::store::ObjectStore;

/// Reacts to app-lifecycle events on the bus and keeps the local caches
/// in step with the blob store: app deletion clears everything, staging
/// success clears the now-obsolete package and the stale local copies.
/// Also owns the periodic cache maintenance tickers.
pub struct Listener {
    droplets: Arc<ArtifactCache>,
    packages: Arc<ArtifactCache>,
    buildpacks: Arc<ArtifactCache>,
    droplet_store: Arc<dyn ObjectStore>,
    package_store: Arc<dyn ObjectStore>,
}

impl Listener {
    pub fn new(
        droplets: Arc<ArtifactCache>,
        packages: Arc<ArtifactCache>,
        buildpacks: Arc<ArtifactCache>,
        droplet_store: Arc<dyn ObjectStore>,
        package_store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            droplets,
            packages,
            buildpacks,
            droplet_store,
            package_store,
        }
    }

    pub async fn start(self: Arc<Self>, bus: Arc<dyn MessageBus>) -> anyhow::Result<()> {
        let mut deleted = bus.subscribe(APP_DELETED_SUBJECT, None).await?;
        let listener = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = deleted.recv().await {
                // The payload is the raw guid bytes, not JSON.
                let guid = String::from_utf8_lossy(&msg.payload).trim().to_string();
                if guid.is_empty() {
                    continue;
                }
                listener.handle_app_deleted(&guid).await;
            }
        });

        let mut staged = bus.subscribe(STAGING_SUCCESS_SUBJECT, None).await?;
        let listener = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = staged.recv().await {
                let guid = match deserialize_message::<StagingSuccessMsg>(&msg.payload) {
                    Ok(msg) => msg.guid,
                    Err(e) => {
                        warn!(subject = STAGING_SUCCESS_SUBJECT, error = %e, "malformed payload dropped");
                        continue;
                    }
                };
                if guid.is_empty() {
                    continue;
                }
                listener.handle_staging_success(&guid).await;
            }
        });

        Ok(())
    }

    /// App deleted: nothing about it may survive, locally or remotely.
    async fn handle_app_deleted(&self, guid: &str) {
        info!(guid = %guid, "app deleted, invalidating caches and blob store");
        self.packages.destroy(guid);
        self.droplets.destroy(guid);
        self.buildpacks.destroy(guid);

        if let Err(e) = self.droplet_store.delete(guid).await {
            warn!(guid = %guid, error = %e, "droplet blob delete failed");
        }
        if let Err(e) = self.package_store.delete(guid).await {
            warn!(guid = %guid, error = %e, "package blob delete failed");
        }
    }

    /// Staging produced a droplet: the source package is obsolete, and
    /// stale local copies must not shadow the fresh remote droplet.
    async fn handle_staging_success(&self, guid: &str) {
        info!(guid = %guid, "staging succeeded, invalidating package and droplet caches");
        self.packages.destroy(guid);
        self.droplets.destroy(guid);

        if let Err(e) = self.package_store.delete(guid).await {
            warn!(guid = %guid, error = %e, "package blob delete failed");
        }
    }

    /// One maintenance ticker per cache class: TTL sweep, then the
    /// disk-pressure walk. A zero TTL disables the class's ticker.
    pub fn spawn_sweep_loops(&self, intervals: [(Arc<ArtifactCache>, Duration); 3]) {
        for (cache, interval) in intervals {
            if cache.ttl().is_zero() || interval.is_zero() {
                continue;
            }
            tokio::spawn(async move {
                let mut intv = tokio::time::interval(interval);
                intv.tick().await; // the first tick is immediate
                loop {
                    intv.tick().await;
                    info!(class = cache.label(), "cache maintenance tick");
                    let now = Utc::now();
                    cache.sweep(now);
                    cache.pressure_sweep(now);
                }
            });
        }
    }
}
