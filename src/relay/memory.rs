//! In-process bus
//!
//! A [`MemoryBroker`] stands in for an external pub/sub server. Each hub
//! connects its own [`MemoryBus`] to a shared broker, which gives a multi-node
//! setup inside one process. The broker can be switched off to simulate an
//! outage.

use super::{Bus, BusError, BusMessage};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

const INCOMING_CAPACITY: usize = 1024;

/// Shared message broker
#[derive(Debug)]
pub struct MemoryBroker {
    /// Topic -> (bus id -> incoming queue)
    topics: Mutex<HashMap<String, HashMap<u64, mpsc::Sender<BusMessage>>>>,
    available: AtomicBool,
    next_id: AtomicU64,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
        }
    }

    /// Turn the broker on or off
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), BusError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(BusError::Unavailable("broker offline".to_string()))
        }
    }

    /// Number of buses subscribed to `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, HashMap::len)
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.check()?;

        let topics = self.topics.lock();
        let Some(subscribers) = topics.get(topic) else {
            return Ok(());
        };

        for (id, tx) in subscribers {
            let msg = BusMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            if tx.try_send(msg).is_err() {
                debug!(bus_id = id, topic = %topic, "Bus subscriber lagging, message dropped");
            }
        }
        Ok(())
    }

    fn subscribe(&self, id: u64, topic: &str, tx: &mpsc::Sender<BusMessage>) -> Result<(), BusError> {
        self.check()?;
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .insert(id, tx.clone());
        Ok(())
    }

    fn unsubscribe(&self, id: u64, topic: &str) -> Result<(), BusError> {
        self.check()?;
        self.remove(id, topic);
        Ok(())
    }

    fn remove(&self, id: u64, topic: &str) {
        let mut topics = self.topics.lock();
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

/// One node's connection to a [`MemoryBroker`]
pub struct MemoryBus {
    id: u64,
    broker: Arc<MemoryBroker>,
    tx: mpsc::Sender<BusMessage>,
    rx: Mutex<Option<mpsc::Receiver<BusMessage>>>,
    topics: Mutex<HashSet<String>>,
}

impl MemoryBus {
    pub fn connect(broker: &Arc<MemoryBroker>) -> Self {
        let (tx, rx) = mpsc::channel(INCOMING_CAPACITY);
        Self {
            id: broker.next_id.fetch_add(1, Ordering::Relaxed),
            broker: broker.clone(),
            tx,
            rx: Mutex::new(Some(rx)),
            topics: Mutex::new(HashSet::new()),
        }
    }

    /// Topics this bus is subscribed to
    pub fn topics(&self) -> Vec<String> {
        self.topics.lock().iter().cloned().collect()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.broker.publish(topic, payload)
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        self.broker.subscribe(self.id, topic, &self.tx)?;
        self.topics.lock().insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BusError> {
        self.broker.unsubscribe(self.id, topic)?;
        self.topics.lock().remove(topic);
        Ok(())
    }

    fn take_incoming(&self) -> Option<mpsc::Receiver<BusMessage>> {
        self.rx.lock().take()
    }

    fn is_connected(&self) -> bool {
        self.broker.is_available()
    }

    async fn reconnect(&self) -> Result<(), BusError> {
        self.broker.check()
    }
}

impl Drop for MemoryBus {
    fn drop(&mut self) {
        for topic in self.topics.lock().drain() {
            self.broker.remove(self.id, &topic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribed_buses() {
        let broker = Arc::new(MemoryBroker::new());
        let a = MemoryBus::connect(&broker);
        let b = MemoryBus::connect(&broker);
        let mut a_rx = a.take_incoming().unwrap();
        let mut b_rx = b.take_incoming().unwrap();

        a.subscribe("room:1").await.unwrap();
        b.subscribe("room:1").await.unwrap();
        assert_eq!(broker.subscriber_count("room:1"), 2);

        a.publish("room:1", b"hello".to_vec()).await.unwrap();

        // The publisher's own subscription receives it too
        assert_eq!(a_rx.try_recv().unwrap().payload, b"hello".to_vec());
        let msg = b_rx.try_recv().unwrap();
        assert_eq!(msg.topic, "room:1");
        assert_eq!(msg.payload, b"hello".to_vec());
    }

    #[tokio::test]
    async fn test_unsubscribe_and_drop() {
        let broker = Arc::new(MemoryBroker::new());
        let a = MemoryBus::connect(&broker);
        let b = MemoryBus::connect(&broker);

        a.subscribe("room:1").await.unwrap();
        b.subscribe("room:1").await.unwrap();

        a.unsubscribe("room:1").await.unwrap();
        assert_eq!(broker.subscriber_count("room:1"), 1);
        assert!(a.topics().is_empty());

        drop(b);
        assert_eq!(broker.subscriber_count("room:1"), 0);
    }

    #[tokio::test]
    async fn test_outage() {
        let broker = Arc::new(MemoryBroker::new());
        let bus = MemoryBus::connect(&broker);
        assert!(bus.take_incoming().is_some());
        assert!(bus.take_incoming().is_none());

        broker.set_available(false);
        assert!(matches!(
            bus.publish("room:1", Vec::new()).await,
            Err(BusError::Unavailable(_))
        ));
        assert!(bus.subscribe("room:1").await.is_err());
        assert!(bus.reconnect().await.is_err());

        broker.set_available(true);
        bus.reconnect().await.unwrap();
        bus.subscribe("room:1").await.unwrap();
    }
}
