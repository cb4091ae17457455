use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

/// One delivered bus message. `reply_to` is set on request/reply traffic.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub reply_to: Option<String>,
    pub payload: Vec<u8>,
}

/// Seam to the fleet pub/sub transport. Subscribers sharing a queue group
/// receive each message exactly once within that group; plain subscribers
/// all receive a copy. Implementations must never block message producers
/// on slow consumers.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> anyhow::Result<()>;

    async fn publish_request(
        &self,
        subject: &str,
        reply_to: &str,
        payload: Vec<u8>,
    ) -> anyhow::Result<()>;

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> anyhow::Result<mpsc::Receiver<BusMessage>>;
}

const SUBSCRIBER_BUFFER: usize = 1024;

struct Subscription {
    queue_group: Option<String>,
    tx: mpsc::Sender<BusMessage>,
}

#[derive(Default)]
struct Topic {
    subs: Vec<Subscription>,
    // Round-robin cursor per queue group.
    cursors: HashMap<String, usize>,
}

/// In-process bus used for tests and single-node runs. The production
/// transport plugs in behind the same trait.
#[derive(Default)]
pub struct MemoryBus {
    topics: Mutex<HashMap<String, Topic>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn deliver(&self, subject: &str, reply_to: Option<&str>, payload: Vec<u8>) -> Vec<(mpsc::Sender<BusMessage>, BusMessage)> {
        let msg = BusMessage {
            subject: subject.to_string(),
            reply_to: reply_to.map(|s| s.to_string()),
            payload,
        };

        let mut topics = self.topics.lock().unwrap();
        let Some(topic) = topics.get_mut(subject) else {
            debug!(subject = %subject, "publish with no subscribers");
            return Vec::new();
        };
        topic.subs.retain(|s| !s.tx.is_closed());

        let mut targets = Vec::new();
        // Plain subscribers each get a copy.
        for sub in topic.subs.iter().filter(|s| s.queue_group.is_none()) {
            targets.push((sub.tx.clone(), msg.clone()));
        }
        // One member per queue group, rotating.
        let groups: Vec<String> = topic
            .subs
            .iter()
            .filter_map(|s| s.queue_group.clone())
            .collect();
        for group in groups.iter().collect::<std::collections::BTreeSet<_>>() {
            let members: Vec<&Subscription> = topic
                .subs
                .iter()
                .filter(|s| s.queue_group.as_deref() == Some(group.as_str()))
                .collect();
            if members.is_empty() {
                continue;
            }
            let cursor = topic.cursors.entry((*group).clone()).or_insert(0);
            let chosen = &members[*cursor % members.len()];
            *cursor = cursor.wrapping_add(1);
            targets.push((chosen.tx.clone(), msg.clone()));
        }
        targets
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        // Senders are resolved under the lock, delivery happens outside it.
        for (tx, msg) in self.deliver(subject, None, payload) {
            let _ = tx.send(msg).await;
        }
        Ok(())
    }

    async fn publish_request(
        &self,
        subject: &str,
        reply_to: &str,
        payload: Vec<u8>,
    ) -> anyhow::Result<()> {
        for (tx, msg) in self.deliver(subject, Some(reply_to), payload) {
            let _ = tx.send(msg).await;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> anyhow::Result<mpsc::Receiver<BusMessage>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut topics = self.topics.lock().unwrap();
        topics.entry(subject.to_string()).or_default().subs.push(Subscription {
            queue_group: queue_group.map(|s| s.to_string()),
            tx,
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_subscribers_all_receive_a_copy() {
        let bus = MemoryBus::new();
        let mut a = bus.subscribe("x", None).await.unwrap();
        let mut b = bus.subscribe("x", None).await.unwrap();

        bus.publish("x", b"hello".to_vec()).await.unwrap();

        assert_eq!(a.recv().await.unwrap().payload, b"hello");
        assert_eq!(b.recv().await.unwrap().payload, b"hello");
    }

    #[tokio::test]
    async fn queue_group_delivers_to_exactly_one_member() {
        let bus = MemoryBus::new();
        let mut a = bus.subscribe("x", Some("workers")).await.unwrap();
        let mut b = bus.subscribe("x", Some("workers")).await.unwrap();

        bus.publish("x", b"1".to_vec()).await.unwrap();
        bus.publish("x", b"2".to_vec()).await.unwrap();

        // Round robin: each member sees exactly one of the two.
        assert_eq!(a.recv().await.unwrap().payload, b"1");
        assert_eq!(b.recv().await.unwrap().payload, b"2");
        assert!(a.try_recv().is_err());
        assert!(b.try_recv().is_err());
    }

    #[tokio::test]
    async fn reply_to_travels_with_the_message() {
        let bus = MemoryBus::new();
        let mut rx = bus.subscribe("req", Some("g")).await.unwrap();

        bus.publish_request("req", "inbox.1", b"q".to_vec()).await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.reply_to.as_deref(), Some("inbox.1"));
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = MemoryBus::new();
        let rx = bus.subscribe("x", None).await.unwrap();
        drop(rx);
        let mut live = bus.subscribe("x", None).await.unwrap();

        bus.publish("x", b"m".to_vec()).await.unwrap();
        assert_eq!(live.recv().await.unwrap().payload, b"m");
    }
}
