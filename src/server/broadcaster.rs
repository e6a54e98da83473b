//! Topic fan-out
//!
//! A publish takes a snapshot of the topic's subscribers and makes exactly one
//! non-blocking enqueue attempt per subscriber. Failures are collected into
//! the [`DeliveryReport`]; they never stop delivery to the others.

use crate::error::{HubError, Result};
use crate::server::connection::{ChannelId, ConnectionId};
use crate::server::subscriptions::SubscriptionTable;
use crate::topics::TopicName;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use uuid::Uuid;

/// Identifies one server process on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An immutable unit of broadcast
#[derive(Debug, Clone)]
pub struct BroadcastMessage {
    topic: String,
    payload: Value,
    enqueued_at: Instant,
    origin: NodeId,
}

impl BroadcastMessage {
    pub fn new(topic: impl Into<String>, payload: Value, origin: NodeId) -> Self {
        Self {
            topic: topic.into(),
            payload,
            enqueued_at: Instant::now(),
            origin,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    /// The process that published this message
    pub fn origin(&self) -> NodeId {
        self.origin
    }
}

/// One subscriber that could not be reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub connection_id: ConnectionId,
    pub channel_id: ChannelId,
    pub error: HubError,
}

/// Outcome of one publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub topic: String,
    /// Subscribers in the snapshot
    pub attempted: usize,
    /// Successful enqueues
    pub delivered: usize,
    pub failures: Vec<DeliveryFailure>,
}

impl DeliveryReport {
    fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            attempted: 0,
            delivered: 0,
            failures: Vec::new(),
        }
    }

    /// Every subscriber in the snapshot got the message
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "topic": self.topic,
            "attempted": self.attempted,
            "delivered": self.delivered,
            "failures": self.failures.iter().map(|f| serde_json::json!({
                "connection_id": f.connection_id.to_string(),
                "channel_id": f.channel_id.to_string(),
                "error": f.error.to_string(),
            })).collect::<Vec<_>>(),
        })
    }
}

/// Fans payloads out to the local subscribers of a topic
pub struct Broadcaster {
    table: Arc<SubscriptionTable>,
    node_id: NodeId,
    /// Queue towards the relay, when one is attached
    uplink: RwLock<Option<mpsc::Sender<Arc<BroadcastMessage>>>>,
}

impl Broadcaster {
    pub fn new(table: Arc<SubscriptionTable>, node_id: NodeId) -> Self {
        Self {
            table,
            node_id,
            uplink: RwLock::new(None),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn attach_uplink(&self, tx: mpsc::Sender<Arc<BroadcastMessage>>) {
        *self.uplink.write() = Some(tx);
    }

    pub fn detach_uplink(&self) {
        *self.uplink.write() = None;
    }

    /// Publish to local subscribers and hand the message to the relay.
    ///
    /// Returns once every enqueue attempt has been made; delivery itself is
    /// up to each connection's writer.
    pub fn publish(&self, topic: &str, payload: Value) -> Result<DeliveryReport> {
        let topic = TopicName::parse(topic)?;
        let message = Arc::new(BroadcastMessage::new(topic.into_string(), payload, self.node_id));

        let report = self.deliver_local(&message);
        self.forward(message);

        Ok(report)
    }

    /// Deliver to this process's subscribers only
    pub fn deliver_local(&self, message: &Arc<BroadcastMessage>) -> DeliveryReport {
        let mut report = DeliveryReport::new(message.topic());
        let subscribers = self.table.subscribers_of(message.topic());

        if subscribers.is_empty() {
            debug!(topic = %message.topic(), "No subscribers for topic");
            return report;
        }

        for channel in subscribers {
            report.attempted += 1;
            match channel.deliver(message) {
                Ok(()) => report.delivered += 1,
                Err(error) => {
                    // Expected during rapid disconnects
                    debug!(
                        conn_id = %channel.connection_id(),
                        channel_id = %channel.id(),
                        error = %error,
                        "Failed to enqueue broadcast"
                    );
                    report.failures.push(DeliveryFailure {
                        connection_id: channel.connection_id(),
                        channel_id: channel.id(),
                        error,
                    });
                }
            }
        }

        debug!(
            topic = %message.topic(),
            attempted = report.attempted,
            delivered = report.delivered,
            "Broadcast delivered locally"
        );

        report
    }

    fn forward(&self, message: Arc<BroadcastMessage>) {
        let uplink = self.uplink.read();
        let Some(tx) = uplink.as_ref() else {
            return;
        };

        match tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                warn!(topic = %message.topic(), "Relay uplink full, message not forwarded to bus");
            }
            Err(TrySendError::Closed(message)) => {
                warn!(topic = %message.topic(), "Relay uplink closed, message not forwarded to bus");
            }
        }
    }
}
