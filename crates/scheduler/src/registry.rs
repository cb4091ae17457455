use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use common::{
    deserialize_message, serialize_message, DeaAdvertiseMsg, DeaShutdownMsg, FindDeaReply,
    FindDeaRequest, DEA_ADVERTISE_SUBJECT, DEA_DISPATCH_SUBJECT, DEA_SHUTDOWN_SUBJECT,
    DISPATCH_QUEUE_GROUP,
};

use crate::bus::MessageBus;

/// The accepted resource state of one execution node. `last_update` is the
/// wall-clock instant the most recent advertisement was taken in.
#[derive(Debug, Clone, Serialize)]
pub struct NodeAdvertisement {
    pub id: String,
    pub stacks: Vec<String>,
    pub available_memory: i64,
    pub available_disk: i64,
    pub app_id_to_count: HashMap<String, i64>,
    pub placement_properties: HashMap<String, String>,
    pub docker_vm: bool,
    pub last_update: DateTime<Utc>,
}

/// Soft-state registry of node advertisements plus the placement engine.
///
/// One coarse mutex guards the map; every operation takes a snapshot or
/// mutates in place and performs no I/O while holding the lock.
pub struct DeaPool {
    stale_threshold: Duration,
    endpoints: Mutex<HashMap<String, NodeAdvertisement>>,
}

impl DeaPool {
    pub fn new(stale_threshold: Duration) -> Self {
        Self {
            stale_threshold,
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    /// Accept an advertisement, replacing any prior entry wholesale.
    pub fn upsert(&self, msg: DeaAdvertiseMsg) {
        self.upsert_at(msg, Utc::now());
    }

    fn upsert_at(&self, msg: DeaAdvertiseMsg, now: DateTime<Utc>) {
        if msg.id.is_empty() {
            warn!("dropping advertisement without a node id");
            return;
        }
        let adv = NodeAdvertisement {
            id: msg.id.clone(),
            stacks: msg.stacks,
            available_memory: msg.available_memory,
            available_disk: msg.available_disk,
            app_id_to_count: msg.app_id_to_count,
            placement_properties: msg.placement_properties,
            docker_vm: msg.docker_vm,
            last_update: now,
        };
        let mut endpoints = self.endpoints.lock().unwrap();
        endpoints.insert(msg.id, adv);
    }

    /// Drop a node, typically on a shutdown notice. Idempotent.
    pub fn remove(&self, node_id: &str) {
        let mut endpoints = self.endpoints.lock().unwrap();
        if endpoints.remove(node_id).is_some() {
            info!(node = %node_id, "node removed from pool");
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dump the registry keyed by node id, for the HTTP surface.
    pub fn dump(&self) -> BTreeMap<String, NodeAdvertisement> {
        let endpoints = self.endpoints.lock().unwrap();
        endpoints
            .iter()
            .map(|(id, adv)| (id.clone(), adv.clone()))
            .collect()
    }

    /// Delete every entry whose advertisement has gone stale.
    pub fn prune(&self, now: DateTime<Utc>) {
        let cutoff = now - self.stale_threshold;
        let mut endpoints = self.endpoints.lock().unwrap();
        endpoints.retain(|id, adv| {
            let live = adv.last_update >= cutoff;
            if !live {
                info!(node = %id, "pruning stale node");
            }
            live
        });
    }

    pub fn find(&self, request: &FindDeaRequest) -> FindDeaReply {
        self.find_at(request, Utc::now())
    }

    /// Answer a placement query against a single consistent snapshot.
    ///
    /// Small candidate sets bias toward low available memory to pack
    /// tightly; large sets bias toward the upper half to spread load.
    /// The asymmetry is deliberate and relied upon by reproducibility
    /// tests elsewhere in the platform.
    fn find_at(&self, request: &FindDeaRequest, now: DateTime<Utc>) -> FindDeaReply {
        let cutoff = now - self.stale_threshold;
        let snapshot: Vec<NodeAdvertisement> = {
            let endpoints = self.endpoints.lock().unwrap();
            endpoints.values().cloned().collect()
        };

        let mut reply = FindDeaReply::default();

        if request.owner_app {
            let mut owners: Vec<String> = snapshot
                .iter()
                .filter(|adv| owns_app(adv, &request.app_id))
                .map(|adv| adv.id.clone())
                .collect();
            owners.sort();
            reply.owner_dea_ids = owners;
            return reply;
        }

        let mut candidates: Vec<&NodeAdvertisement> = snapshot
            .iter()
            .filter(|adv| {
                if request.docker && !adv.docker_vm {
                    return false;
                }
                if adv.available_memory <= request.memory {
                    return false;
                }
                // The request's disk figure is recorded but never compared
                // against the node; only this floor applies.
                if adv.available_disk <= 1024 {
                    return false;
                }
                if !request.stacks.is_empty() && !adv.stacks.iter().any(|s| s == &request.stacks) {
                    return false;
                }
                if request.other_dea && owns_app(adv, &request.app_id) {
                    return false;
                }
                adv.last_update >= cutoff
            })
            .collect();

        let n = candidates.len();
        debug!(candidates = n, app = %request.app_id, disk = request.disk, "placement filter done");
        if n == 0 {
            return reply;
        }

        candidates.sort_by(|a, b| {
            a.available_memory
                .cmp(&b.available_memory)
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut rng = rand::thread_rng();
        let index = if n == 1 {
            0
        } else if n > 5 {
            n - rng.gen_range(0..n / 2) - 1
        } else {
            rng.gen_range(0..n - 1)
        };
        reply.dea_id = candidates[index].id.clone();
        reply
    }

    /// Wire the pool to the bus: advertisements, shutdowns, and the
    /// queue-grouped dispatch subject, plus the prune ticker.
    pub async fn start(self: Arc<Self>, bus: Arc<dyn MessageBus>) -> anyhow::Result<()> {
        let mut adverts = bus.subscribe(DEA_ADVERTISE_SUBJECT, None).await?;
        let pool = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = adverts.recv().await {
                match deserialize_message::<DeaAdvertiseMsg>(&msg.payload) {
                    Ok(adv) => pool.upsert(adv),
                    Err(e) => warn!(subject = DEA_ADVERTISE_SUBJECT, error = %e, "malformed payload dropped"),
                }
            }
        });

        let mut shutdowns = bus.subscribe(DEA_SHUTDOWN_SUBJECT, None).await?;
        let pool = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = shutdowns.recv().await {
                match deserialize_message::<DeaShutdownMsg>(&msg.payload) {
                    // The notice also carries app_id_to_count; nothing uses it.
                    Ok(down) => pool.remove(&down.id),
                    Err(e) => warn!(subject = DEA_SHUTDOWN_SUBJECT, error = %e, "malformed payload dropped"),
                }
            }
        });

        let mut dispatch = bus
            .subscribe(DEA_DISPATCH_SUBJECT, Some(DISPATCH_QUEUE_GROUP))
            .await?;
        let pool = self.clone();
        let reply_bus = bus.clone();
        tokio::spawn(async move {
            while let Some(msg) = dispatch.recv().await {
                let request = match deserialize_message::<FindDeaRequest>(&msg.payload) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(subject = DEA_DISPATCH_SUBJECT, error = %e, "malformed placement request dropped");
                        continue;
                    }
                };
                let reply = pool.find(&request);
                info!(app = %request.app_id, pick = %reply.dea_id, "placement dispatched");
                if let Some(reply_to) = msg.reply_to.as_deref() {
                    if let Err(e) = reply_bus.publish(reply_to, serialize_message(&reply)).await {
                        warn!(error = %e, "failed to publish placement reply");
                    }
                }
            }
        });

        self.spawn_prune_loop();
        Ok(())
    }

    fn spawn_prune_loop(self: Arc<Self>) {
        if self.stale_threshold.is_zero() {
            return;
        }
        tokio::spawn(async move {
            let mut intv = tokio::time::interval(self.stale_threshold);
            intv.tick().await; // first tick fires immediately
            loop {
                intv.tick().await;
                self.prune(Utc::now());
            }
        });
    }
}

fn owns_app(adv: &NodeAdvertisement, app_id: &str) -> bool {
    adv.app_id_to_count.get(app_id).copied().unwrap_or(0) > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adv(id: &str, memory: i64) -> DeaAdvertiseMsg {
        DeaAdvertiseMsg {
            id: id.to_string(),
            stacks: vec!["linux".to_string()],
            available_memory: memory,
            available_disk: 4096,
            ..Default::default()
        }
    }

    fn request(memory: i64) -> FindDeaRequest {
        FindDeaRequest {
            app_id: "app-1".to_string(),
            memory,
            disk: 512,
            stacks: "linux".to_string(),
            ..Default::default()
        }
    }

    fn pool() -> DeaPool {
        DeaPool::new(Duration::from_secs(10))
    }

    #[test]
    fn upsert_replaces_wholesale() {
        let pool = pool();
        let mut first = adv("dea-1", 512);
        first.app_id_to_count.insert("app-1".into(), 2);
        pool.upsert(first);
        pool.upsert(adv("dea-1", 1024));

        let dump = pool.dump();
        assert_eq!(dump.len(), 1);
        let entry = &dump["dea-1"];
        assert_eq!(entry.available_memory, 1024);
        // No field-level merge: the old app counts are gone.
        assert!(entry.app_id_to_count.is_empty());
    }

    #[test]
    fn advertisement_without_id_is_dropped() {
        let pool = pool();
        pool.upsert(DeaAdvertiseMsg::default());
        assert!(pool.is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let pool = pool();
        pool.upsert(adv("dea-1", 512));
        pool.remove("dea-1");
        pool.remove("dea-1");
        assert!(pool.is_empty());
    }

    #[test]
    fn prune_drops_only_stale_entries() {
        let pool = pool();
        pool.upsert(adv("fresh", 512));
        pool.upsert_at(adv("stale", 512), Utc::now() - Duration::from_secs(30));

        pool.prune(Utc::now());

        let dump = pool.dump();
        assert!(dump.contains_key("fresh"));
        assert!(!dump.contains_key("stale"));
    }

    #[test]
    fn empty_registry_yields_empty_reply() {
        let reply = pool().find(&request(300));
        assert_eq!(reply, FindDeaReply::default());
    }

    #[test]
    fn two_candidates_always_picks_the_smaller() {
        // Scenario: A=512, B=1024, C=256 with request mem 300. C filters
        // out, and with n=2 the draw range collapses to index 0 => A.
        let pool = pool();
        pool.upsert(adv("A", 512));
        pool.upsert(adv("B", 1024));
        pool.upsert(adv("C", 256));

        for _ in 0..50 {
            let reply = pool.find(&request(300));
            assert_eq!(reply.dea_id, "A");
            assert!(reply.owner_dea_ids.is_empty());
        }
    }

    #[test]
    fn small_fleet_never_picks_the_largest() {
        let pool = pool();
        for (i, mem) in [100, 200, 300, 400, 500].into_iter().enumerate() {
            pool.upsert(adv(&format!("dea-{i}"), mem));
        }
        for _ in 0..200 {
            let reply = pool.find(&request(50));
            assert_ne!(reply.dea_id, "dea-4", "largest node must be excluded");
            assert!(!reply.dea_id.is_empty());
        }
    }

    #[test]
    fn large_fleet_picks_only_from_the_upper_half() {
        let pool = pool();
        for i in 1..=10 {
            pool.upsert(adv(&format!("dea-{i:02}"), (i * 10) as i64));
        }
        // Ascending sort puts dea-06..dea-10 in the upper half.
        for _ in 0..200 {
            let reply = pool.find(&request(5));
            let picked: u32 = reply.dea_id.trim_start_matches("dea-").parse().unwrap();
            assert!(picked >= 6, "pick {picked} fell outside the upper half");
        }
    }

    #[test]
    fn owner_query_skips_resource_filters() {
        let pool = pool();
        // Would fail every candidate filter: tiny memory, no disk, wrong stack.
        let mut owner = DeaAdvertiseMsg {
            id: "owner-1".into(),
            stacks: vec!["windows".into()],
            available_memory: 1,
            available_disk: 1,
            ..Default::default()
        };
        owner.app_id_to_count.insert("app-1".into(), 3);
        pool.upsert(owner);
        let mut bystander = adv("other", 2048);
        bystander.app_id_to_count.insert("app-2".into(), 1);
        pool.upsert(bystander);

        let mut req = request(300);
        req.owner_app = true;
        let reply = pool.find(&req);
        assert_eq!(reply.owner_dea_ids, vec!["owner-1".to_string()]);
        assert!(reply.dea_id.is_empty());
    }

    #[test]
    fn filters_docker_stack_disk_and_owners() {
        let pool = pool();

        let mut no_docker = adv("no-docker", 2048);
        no_docker.docker_vm = false;
        pool.upsert(no_docker);

        let mut wrong_stack = adv("wrong-stack", 2048);
        wrong_stack.stacks = vec!["windows".into()];
        wrong_stack.docker_vm = true;
        pool.upsert(wrong_stack);

        let mut low_disk = adv("low-disk", 2048);
        low_disk.available_disk = 1024; // strict: must exceed the floor
        low_disk.docker_vm = true;
        pool.upsert(low_disk);

        let mut resident = adv("resident", 2048);
        resident.docker_vm = true;
        resident.app_id_to_count.insert("app-1".into(), 1);
        pool.upsert(resident);

        let mut fit = adv("fit", 2048);
        fit.docker_vm = true;
        pool.upsert(fit);

        let mut req = request(300);
        req.docker = true;
        req.other_dea = true;
        for _ in 0..50 {
            let reply = pool.find(&req);
            assert_eq!(reply.dea_id, "fit");
        }
    }

    #[test]
    fn stale_nodes_are_not_candidates_even_before_prune() {
        let pool = pool();
        pool.upsert_at(adv("stale", 4096), Utc::now() - Duration::from_secs(60));
        let reply = pool.find(&request(300));
        assert!(reply.dea_id.is_empty());
    }

    #[tokio::test]
    async fn bus_round_trip_updates_pool_and_replies() {
        use crate::bus::{MemoryBus, MessageBus};

        let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new());
        let pool = Arc::new(DeaPool::new(Duration::from_secs(10)));
        pool.clone().start(bus.clone()).await.unwrap();

        let mut inbox = bus.subscribe("inbox.test", None).await.unwrap();

        bus.publish(
            DEA_ADVERTISE_SUBJECT,
            serialize_message(&adv("dea-1", 2048)),
        )
        .await
        .unwrap();

        // The advertise handler runs on its own task; wait for it to land.
        for _ in 0..100 {
            if !pool.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pool.len(), 1);

        bus.publish_request(
            DEA_DISPATCH_SUBJECT,
            "inbox.test",
            serialize_message(&request(300)),
        )
        .await
        .unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(2), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        let reply: FindDeaReply = deserialize_message(&msg.payload).unwrap();
        assert_eq!(reply.dea_id, "dea-1");

        bus.publish(
            DEA_SHUTDOWN_SUBJECT,
            serialize_message(&DeaShutdownMsg {
                id: "dea-1".into(),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        for _ in 0..100 {
            if pool.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(pool.is_empty());
    }
}
