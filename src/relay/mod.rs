//! Cross-process relay
//!
//! Bridges the local [`Broadcaster`] to an external [`Bus`] so publishes on
//! one node reach subscribers on every node. Bus I/O happens in background
//! workers; the publish path only does a non-blocking enqueue onto the uplink.
//!
//! Each envelope carries the publishing [`NodeId`]. A node drops envelopes it
//! published itself, so nothing is delivered twice and nothing is re-published.

pub mod memory;
pub mod postgres;

use crate::config::RelayConfig;
use crate::server::{
    BroadcastMessage, Broadcaster, DeliveryReport, NodeId, SubscriptionTable, TopicActivity,
};
use crate::topics::TopicName;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("bus unavailable: {0}")]
    Unavailable(String),

    #[error("payload too large for bus: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("bus closed")]
    Closed,
}

impl From<BusError> for crate::error::HubError {
    fn from(e: BusError) -> Self {
        crate::error::HubError::BusUnavailable(e.to_string())
    }
}

/// A message received from the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// External pub/sub transport
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Start receiving messages for `topic`. Subscribing twice is a no-op.
    async fn subscribe(&self, topic: &str) -> Result<(), BusError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), BusError>;

    /// Stream of incoming messages; can be taken once
    fn take_incoming(&self) -> Option<mpsc::Receiver<BusMessage>>;

    /// False once the connection carrying subscriptions is known to be lost
    fn is_connected(&self) -> bool {
        true
    }

    /// Re-establish the bus connection after a failure. Subscriptions may be
    /// lost; callers re-subscribe afterwards.
    async fn reconnect(&self) -> Result<(), BusError> {
        Ok(())
    }
}

/// Wire format of a relayed broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub origin: NodeId,
    pub topic: String,
    pub payload: Value,
}

pub struct Relay {
    bus: Arc<dyn Bus>,
    broadcaster: Arc<Broadcaster>,
    table: Arc<SubscriptionTable>,
    config: RelayConfig,
    /// True while degraded to local delivery
    health: watch::Sender<bool>,
    /// Wakes the control worker when another worker saw the bus fail
    recovery: Notify,
}

impl Relay {
    pub fn new(
        bus: Arc<dyn Bus>,
        broadcaster: Arc<Broadcaster>,
        table: Arc<SubscriptionTable>,
        config: RelayConfig,
    ) -> Self {
        Self {
            bus,
            broadcaster,
            table,
            config,
            health: watch::channel(false).0,
            recovery: Notify::new(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.broadcaster.node_id()
    }

    /// True while the bus is unreachable and only local delivery works
    pub fn is_degraded(&self) -> bool {
        *self.health.borrow()
    }

    /// Forward a locally published message to the bus
    pub async fn publish_remote(&self, message: &BroadcastMessage) -> Result<(), BusError> {
        let envelope = Envelope {
            origin: message.origin(),
            topic: message.topic().to_string(),
            payload: message.payload().clone(),
        };
        let bytes = serde_json::to_vec(&envelope)
            .map_err(|e| BusError::Unavailable(format!("encode failed: {}", e)))?;

        self.bus.publish(message.topic(), bytes).await
    }

    /// Handle one message from the bus. Returns the local delivery report,
    /// or None if the message was dropped.
    pub fn on_remote_message(&self, topic: &str, payload: &[u8]) -> Option<DeliveryReport> {
        let envelope: Envelope = match serde_json::from_slice(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Dropping undecodable bus message");
                return None;
            }
        };

        if envelope.origin == self.node_id() {
            debug!(topic = %envelope.topic, "Dropping own message from bus");
            return None;
        }

        if let Err(e) = TopicName::parse(&envelope.topic) {
            warn!(topic = %envelope.topic, error = %e, "Dropping bus message with invalid topic");
            return None;
        }

        let message = Arc::new(BroadcastMessage::new(
            envelope.topic,
            envelope.payload,
            envelope.origin,
        ));
        Some(self.broadcaster.deliver_local(&message))
    }

    /// Join the bus subscription for a topic that became locally active
    pub async fn topic_activated(&self, topic: &str) -> Result<(), BusError> {
        self.bus.subscribe(topic).await?;
        debug!(topic = %topic, "Joined bus topic");
        Ok(())
    }

    /// Leave the bus subscription for a topic with no local subscribers
    pub async fn topic_deactivated(&self, topic: &str) -> Result<(), BusError> {
        self.bus.unsubscribe(topic).await?;
        debug!(topic = %topic, "Left bus topic");
        Ok(())
    }

    fn mark_degraded(&self) {
        if !self.health.send_replace(true) {
            warn!("Bus unavailable, degrading to local delivery");
        }
    }

    /// Degrade and hand recovery to the control worker
    fn request_recovery(&self) {
        self.mark_degraded();
        self.recovery.notify_one();
    }

    /// Resolves once the bus is usable again
    async fn wait_recovered(&self) {
        let mut health = self.health.subscribe();
        let _ = health.wait_for(|degraded| !*degraded).await;
    }

    /// Reconnect with exponential backoff, rejoin every active topic and
    /// retry the leaves that failed during the outage
    async fn recover(&self, stale: &mut HashSet<String>) {
        let mut attempt = 0u32;
        loop {
            let delay = self.config.backoff_delay(attempt);
            let jitter_ms = rand::rng().random_range(0..=delay.as_millis() as u64 / 2);
            tokio::time::sleep(delay + Duration::from_millis(jitter_ms)).await;
            attempt = attempt.saturating_add(1);

            if let Err(e) = self.bus.reconnect().await {
                warn!(attempt = attempt, error = %e, "Bus reconnect failed");
                continue;
            }

            match self.resync(stale).await {
                Ok(joined) => {
                    self.health.send_replace(false);
                    info!(topics = joined, attempts = attempt, "Bus connection restored");
                    return;
                }
                Err(e) => warn!(attempt = attempt, error = %e, "Bus resync failed"),
            }
        }
    }

    async fn resync(&self, stale: &mut HashSet<String>) -> Result<usize, BusError> {
        let active = self.table.active_topics();
        for topic in &active {
            self.topic_activated(topic).await?;
        }

        let leaving: Vec<String> = stale
            .iter()
            .filter(|topic| !self.table.is_active(topic))
            .cloned()
            .collect();
        for topic in leaving {
            self.topic_deactivated(&topic).await?;
        }
        stale.clear();

        Ok(active.len())
    }

    /// Attach to the broadcaster and subscription table and spawn the workers
    pub fn start(self: Arc<Self>) -> RelayHandle {
        let (uplink_tx, uplink_rx) = mpsc::channel(self.config.uplink_capacity);
        let (activity_tx, activity_rx) = mpsc::unbounded_channel();

        self.table.watch_activity(activity_tx);
        self.broadcaster.attach_uplink(uplink_tx);

        let mut tasks = vec![
            tokio::spawn(run_outbound(self.clone(), uplink_rx)),
            tokio::spawn(run_control(self.clone(), activity_rx)),
        ];

        match self.bus.take_incoming() {
            Some(incoming) => tasks.push(tokio::spawn(run_inbound(self.clone(), incoming))),
            None => error!("Bus incoming stream already taken, remote messages will not be delivered"),
        }

        info!(node_id = %self.node_id(), "Relay started");

        RelayHandle { relay: self, tasks }
    }
}

/// Running relay workers
pub struct RelayHandle {
    relay: Arc<Relay>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayHandle {
    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Detach from the hub and stop the workers
    pub fn shutdown(self) {
        self.relay.broadcaster.detach_uplink();
        self.relay.table.unwatch_activity();
        for task in &self.tasks {
            task.abort();
        }
        info!(node_id = %self.relay.node_id(), "Relay stopped");
    }
}

async fn run_outbound(relay: Arc<Relay>, mut rx: mpsc::Receiver<Arc<BroadcastMessage>>) {
    while let Some(message) = rx.recv().await {
        match relay.publish_remote(&message).await {
            Ok(()) => {}
            Err(BusError::PayloadTooLarge(size)) => {
                warn!(topic = %message.topic(), size = size, "Message too large for bus, delivered locally only");
            }
            Err(e) => {
                warn!(topic = %message.topic(), error = %e, "Bus publish failed");
                relay.request_recovery();
                relay.wait_recovered().await;
                if let Err(e) = relay.publish_remote(&message).await {
                    warn!(topic = %message.topic(), error = %e, "Dropping message after bus retry");
                }
            }
        }
    }
}

/// Sole owner of bus subscriptions: applies activity transitions in order,
/// watches the bus connection and runs recovery
async fn run_control(relay: Arc<Relay>, mut activity: mpsc::UnboundedReceiver<TopicActivity>) {
    // Leaves that failed while the bus was down
    let mut stale = HashSet::new();

    // Topics that were active before the relay attached
    for topic in relay.table.active_topics() {
        if let Err(e) = relay.topic_activated(&topic).await {
            warn!(topic = %topic, error = %e, "Failed to join bus topic");
            relay.mark_degraded();
            break;
        }
    }

    let mut ticker = tokio::time::interval(relay.config.health_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if relay.is_degraded() {
            relay.recover(&mut stale).await;
            continue;
        }

        tokio::select! {
            event = activity.recv() => {
                let Some(event) = event else { break };
                let result = match &event {
                    TopicActivity::Active(topic) => {
                        stale.remove(topic);
                        relay.topic_activated(topic).await
                    }
                    TopicActivity::Idle(topic) => {
                        let result = relay.topic_deactivated(topic).await;
                        if result.is_err() {
                            stale.insert(topic.clone());
                        }
                        result
                    }
                };
                if let Err(e) = result {
                    warn!(event = ?event, error = %e, "Bus subscription change failed");
                    relay.mark_degraded();
                }
            }
            _ = relay.recovery.notified() => {}
            _ = ticker.tick() => {
                if !relay.bus.is_connected() {
                    warn!("Bus connection lost");
                    relay.mark_degraded();
                }
            }
        }
    }
}

async fn run_inbound(relay: Arc<Relay>, mut incoming: mpsc::Receiver<BusMessage>) {
    while let Some(msg) = incoming.recv().await {
        if let Some(report) = relay.on_remote_message(&msg.topic, &msg.payload) {
            debug!(
                topic = %report.topic,
                delivered = report.delivered,
                "Delivered remote broadcast"
            );
        }
    }
    warn!("Bus incoming stream ended");
    relay.request_recovery();
}
