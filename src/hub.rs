//! Server context
//!
//! A [`Hub`] is built once at startup and wires the registry, subscription
//! table, broadcaster and multiplexer together. Nothing in the crate is a
//! process-wide singleton; tests build as many hubs as they need.

use crate::auth::Authorizer;
use crate::config::HubConfig;
use crate::error::Result;
use crate::relay::{Bus, Relay, RelayHandle};
use crate::server::{
    Broadcaster, ChannelRoutes, ConnectionRegistry, DeliveryReport, Multiplexer, NodeId,
    SubscriptionTable,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

pub struct Hub {
    config: HubConfig,
    table: Arc<SubscriptionTable>,
    registry: Arc<ConnectionRegistry>,
    broadcaster: Arc<Broadcaster>,
    multiplexer: Multiplexer,
    relay: Mutex<Option<RelayHandle>>,
}

impl Hub {
    pub fn new(config: HubConfig, authorizer: Arc<dyn Authorizer>, routes: ChannelRoutes) -> Self {
        let node_id = NodeId::new();
        let table = Arc::new(SubscriptionTable::new(authorizer.clone()));
        let registry = Arc::new(ConnectionRegistry::new(table.clone()));
        let broadcaster = Arc::new(Broadcaster::new(table.clone(), node_id));
        let multiplexer = Multiplexer::new(
            registry.clone(),
            table.clone(),
            broadcaster.clone(),
            routes,
            authorizer,
            config.outbound_capacity,
        );

        info!(node_id = %node_id, "Hub created");

        Self {
            config,
            table,
            registry,
            broadcaster,
            multiplexer,
            relay: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn node_id(&self) -> NodeId {
        self.broadcaster.node_id()
    }

    /// Publish to every subscriber of `topic`, on this node and (with a relay
    /// attached) on every other node
    pub fn publish(&self, topic: &str, payload: Value) -> Result<DeliveryReport> {
        self.broadcaster.publish(topic, payload)
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.multiplexer
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn table(&self) -> &Arc<SubscriptionTable> {
        &self.table
    }

    /// Synchronize broadcasts with other nodes through `bus`.
    /// Replaces any relay attached before.
    pub fn attach_relay(&self, bus: Arc<dyn Bus>) -> Arc<Relay> {
        let mut slot = self.relay.lock();
        if let Some(previous) = slot.take() {
            previous.shutdown();
        }

        let relay = Arc::new(Relay::new(
            bus,
            self.broadcaster.clone(),
            self.table.clone(),
            self.config.relay.clone(),
        ));
        *slot = Some(relay.clone().start());
        relay
    }

    /// The attached relay, if any
    pub fn relay(&self) -> Option<Arc<Relay>> {
        self.relay.lock().as_ref().map(|h| h.relay().clone())
    }

    /// Stop the relay and close every connection
    pub async fn shutdown(&self) {
        let relay = self.relay.lock().take();
        if let Some(handle) = relay {
            handle.shutdown();
        }

        self.multiplexer.close_all("server shutdown").await;
        info!(node_id = %self.node_id(), "Hub shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AllowAll, HandshakeContext};
    use crate::relay::memory::{MemoryBroker, MemoryBus};
    use crate::server::{ConnectionState, OutboundMessage, StreamHandler};
    use serde_json::json;

    fn hub() -> Hub {
        Hub::new(
            HubConfig::new(),
            Arc::new(AllowAll),
            ChannelRoutes::catch_all(Arc::new(StreamHandler::default())),
        )
    }

    #[tokio::test]
    async fn test_publish_through_hub() {
        let hub = hub();
        let (conn, mut rx) = hub
            .multiplexer()
            .accept_connection(HandshakeContext::default())
            .await
            .unwrap();
        hub.multiplexer()
            .open_channel(&conn, "room:1", Value::Null)
            .await
            .unwrap();

        let report = hub.publish("room:1", json!({"n": 1})).unwrap();
        assert_eq!(report.delivered, 1);

        let last = std::iter::from_fn(|| rx.try_recv().ok()).last().unwrap();
        assert!(matches!(last, OutboundMessage::Broadcast { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let hub = hub();
        let broker = Arc::new(MemoryBroker::new());
        hub.attach_relay(Arc::new(MemoryBus::connect(&broker)));
        assert!(hub.relay().is_some());

        let (conn, _rx) = hub
            .multiplexer()
            .accept_connection(HandshakeContext::default())
            .await
            .unwrap();

        hub.shutdown().await;

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(hub.registry().count(), 0);
        assert!(hub.relay().is_none());
    }

    #[test]
    fn test_hubs_have_distinct_node_ids() {
        assert_ne!(hub().node_id(), hub().node_id());
    }
}
