//! Live connection registry

use crate::error::{HubError, Result};
use crate::server::connection::{Channel, Connection, ConnectionId};
use crate::server::subscriptions::SubscriptionTable;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Tracks every live connection by id
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    table: Arc<SubscriptionTable>,
}

impl ConnectionRegistry {
    pub fn new(table: Arc<SubscriptionTable>) -> Self {
        Self {
            connections: DashMap::new(),
            table,
        }
    }

    /// Register a connection; a duplicate id means the id generator is broken
    pub fn register(&self, connection: Arc<Connection>) -> Result<ConnectionId> {
        let id = connection.id();
        match self.connections.entry(id) {
            Entry::Occupied(_) => Err(HubError::DuplicateId(id)),
            Entry::Vacant(entry) => {
                entry.insert(connection);
                debug!(conn_id = %id, "Connection registered");
                Ok(id)
            }
        }
    }

    /// Remove a connection and all of its channel subscriptions.
    ///
    /// Idempotent. The cascade finishes before this returns, so later
    /// publishes never see the connection's channels. Returns the detached
    /// channels with their states untouched; the caller retires them.
    pub fn deregister(&self, id: ConnectionId) -> Vec<Arc<Channel>> {
        let Some((_, connection)) = self.connections.remove(&id) else {
            return Vec::new();
        };

        let channels = connection.take_channels();
        for channel in &channels {
            self.table.detach(channel);
        }

        debug!(conn_id = %id, channels = channels.len(), "Connection deregistered");
        channels
    }

    pub fn lookup(&self, id: ConnectionId) -> Result<Arc<Connection>> {
        self.connections
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(HubError::NotFound(id))
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Snapshot of all live connections
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AllowAll, Identity};
    use crate::server::handlers::StreamHandler;
    use crate::topics::TopicName;
    use serde_json::Value;
    use tokio::sync::mpsc;

    fn registry() -> (Arc<SubscriptionTable>, ConnectionRegistry) {
        let table = Arc::new(SubscriptionTable::new(Arc::new(AllowAll)));
        (table.clone(), ConnectionRegistry::new(table))
    }

    #[test]
    fn test_register_lookup_deregister() {
        let (_table, registry) = registry();
        let (conn, _rx) = Connection::with_queue(Identity::anonymous(), 4);

        let id = registry.register(conn.clone()).unwrap();
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.lookup(id).unwrap().id(), id);

        registry.deregister(id);
        assert_eq!(registry.lookup(id).unwrap_err(), HubError::NotFound(id));

        // Second deregister is a no-op
        assert!(registry.deregister(id).is_empty());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let (_table, registry) = registry();
        let (tx, _rx) = mpsc::channel(4);
        let id = ConnectionId::new();
        let first = Arc::new(Connection::new(id, Identity::anonymous(), tx.clone()));
        let second = Arc::new(Connection::new(id, Identity::anonymous(), tx));

        registry.register(first).unwrap();
        assert_eq!(registry.register(second).unwrap_err(), HubError::DuplicateId(id));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_deregister_cascades_to_table() {
        let (table, registry) = registry();
        let (conn, _rx) = Connection::with_queue(Identity::anonymous(), 4);
        conn.mark_open().unwrap();
        let id = registry.register(conn.clone()).unwrap();

        for name in ["room:1", "room:2"] {
            let ch = Arc::new(Channel::new(name, &conn, Value::Null, Arc::new(StreamHandler::default())));
            conn.insert_channel(ch.clone());
            table.subscribe(&TopicName::parse(name).unwrap(), &ch).unwrap();
        }
        assert_eq!(table.topic_count(), 2);

        let detached = registry.deregister(id);
        assert_eq!(detached.len(), 2);
        assert_eq!(table.topic_count(), 0);
        assert!(detached.iter().all(|ch| ch.topics().is_empty()));
    }
}
