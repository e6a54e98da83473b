//! Topic subscription table
//!
//! Bidirectional index between topics and channels. The topic side lives in a
//! sharded map of weak channel references; the channel side lives inside each
//! channel behind its own lock. Mutations always take the channel lock first
//! and the topic shard second, so both directions change together and
//! unrelated topics never contend.

use crate::auth::Authorizer;
use crate::error::{HubError, Result};
use crate::server::connection::{Channel, ChannelId};
use crate::topics::TopicName;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::debug;

/// Local activity transitions for a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicActivity {
    /// First local subscriber arrived
    Active(String),
    /// Last local subscriber left
    Idle(String),
}

/// Result of a successful subscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// The pair was already subscribed; nothing changed
    pub already_subscribed: bool,
    /// This subscribe created the topic entry
    pub became_active: bool,
}

#[derive(Default)]
struct TopicEntry {
    subscribers: HashMap<ChannelId, Weak<Channel>>,
}

/// Maps topics to the channels streaming from them
pub struct SubscriptionTable {
    topics: DashMap<String, TopicEntry>,
    authorizer: Arc<dyn Authorizer>,
    activity: RwLock<Option<mpsc::UnboundedSender<TopicActivity>>>,
}

impl SubscriptionTable {
    pub fn new(authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            topics: DashMap::new(),
            authorizer,
            activity: RwLock::new(None),
        }
    }

    /// Report activity transitions to `tx` from now on
    pub fn watch_activity(&self, tx: mpsc::UnboundedSender<TopicActivity>) {
        *self.activity.write() = Some(tx);
    }

    pub fn unwatch_activity(&self) {
        *self.activity.write() = None;
    }

    /// Called with the topic shard locked so transitions for a topic are
    /// reported in the order they happened
    fn emit(&self, event: TopicActivity) {
        if let Some(tx) = self.activity.read().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Ask the authorizer whether the channel's identity may stream `topic`
    pub fn authorize(&self, topic: &TopicName, channel: &Channel) -> Result<()> {
        let connection = channel
            .connection()
            .ok_or(HubError::ConnectionClosed(channel.connection_id()))?;

        if self
            .authorizer
            .authorize_subscribe(connection.identity(), topic.as_str())
        {
            Ok(())
        } else {
            Err(HubError::SubscriptionRejected {
                channel: channel.name().to_string(),
                reason: format!("not authorized to stream '{}'", topic),
            })
        }
    }

    /// Subscribe `channel` to `topic`. Rejection leaves the table untouched.
    pub fn subscribe(&self, topic: &TopicName, channel: &Arc<Channel>) -> Result<Ack> {
        self.authorize(topic, channel)?;

        let mut index = channel.index();
        if index.detached {
            return Err(HubError::ConnectionClosed(channel.connection_id()));
        }

        if index.topics.contains(topic.as_str()) {
            return Ok(Ack {
                already_subscribed: true,
                became_active: false,
            });
        }

        let became_active = match self.topics.entry(topic.as_str().to_string()) {
            Entry::Occupied(mut entry) => {
                entry
                    .get_mut()
                    .subscribers
                    .insert(channel.id(), Arc::downgrade(channel));
                false
            }
            Entry::Vacant(entry) => {
                self.emit(TopicActivity::Active(topic.as_str().to_string()));
                let mut fresh = TopicEntry::default();
                fresh.subscribers.insert(channel.id(), Arc::downgrade(channel));
                entry.insert(fresh);
                true
            }
        };
        index.topics.insert(topic.as_str().to_string());

        debug!(topic = %topic, channel_id = %channel.id(), conn_id = %channel.connection_id(), "Subscribed");

        Ok(Ack {
            already_subscribed: false,
            became_active,
        })
    }

    /// Unsubscribe `channel` from `topic`. Returns true if the topic went idle.
    pub fn unsubscribe(&self, topic: &str, channel: &Channel) -> bool {
        let mut index = channel.index();
        if !index.topics.remove(topic) {
            return false;
        }
        self.remove_subscriber(topic, channel.id())
    }

    /// Remove the channel from every topic and refuse further subscriptions.
    /// Returns the topics that went idle.
    pub fn detach(&self, channel: &Channel) -> Vec<String> {
        let mut index = channel.index();
        index.detached = true;

        let topics = std::mem::take(&mut index.topics);
        topics
            .into_iter()
            .filter(|topic| self.remove_subscriber(topic, channel.id()))
            .collect()
    }

    fn remove_subscriber(&self, topic: &str, id: ChannelId) -> bool {
        match self.topics.entry(topic.to_string()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().subscribers.remove(&id);
                if entry.get().subscribers.is_empty() {
                    self.emit(TopicActivity::Idle(topic.to_string()));
                    entry.remove();
                    debug!(topic = %topic, "Topic idle");
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => false,
        }
    }

    /// Point-in-time snapshot of the channels streaming `topic`
    pub fn subscribers_of(&self, topic: &str) -> Vec<Arc<Channel>> {
        self.topics
            .get(topic)
            .map(|entry| {
                entry
                    .subscribers
                    .values()
                    .filter_map(Weak::upgrade)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn topics_of(&self, channel: &Channel) -> Vec<String> {
        channel.topics()
    }

    pub fn is_active(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    pub fn active_topics(&self) -> Vec<String> {
        self.topics.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AllowAll, HandshakeContext, Identity};
    use crate::server::connection::{Connection, OutboundReceiver};
    use crate::server::handlers::StreamHandler;
    use async_trait::async_trait;
    use serde_json::Value;

    struct DenyTopic(&'static str);

    #[async_trait]
    impl Authorizer for DenyTopic {
        async fn authorize(&self, _handshake: &HandshakeContext) -> std::result::Result<Identity, String> {
            Ok(Identity::anonymous())
        }

        fn authorize_subscribe(&self, _identity: &Identity, topic: &str) -> bool {
            topic != self.0
        }
    }

    fn channel(name: &str) -> (Arc<Connection>, Arc<Channel>, OutboundReceiver) {
        let (conn, rx) = Connection::with_queue(Identity::anonymous(), 8);
        conn.mark_open().unwrap();
        let ch = Arc::new(Channel::new(name, &conn, Value::Null, Arc::new(StreamHandler::default())));
        (conn, ch, rx)
    }

    fn topic(name: &str) -> TopicName {
        TopicName::parse(name).unwrap()
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let table = SubscriptionTable::new(Arc::new(AllowAll));
        let (_conn, ch, _rx) = channel("room:42");

        let first = table.subscribe(&topic("room:42"), &ch).unwrap();
        assert!(first.became_active);
        assert!(!first.already_subscribed);

        let second = table.subscribe(&topic("room:42"), &ch).unwrap();
        assert!(second.already_subscribed);
        assert!(!second.became_active);

        assert_eq!(table.subscribers_of("room:42").len(), 1);
        assert_eq!(table.topics_of(&ch), vec!["room:42".to_string()]);
    }

    #[test]
    fn test_unsubscribe_unknown_pair_is_noop() {
        let table = SubscriptionTable::new(Arc::new(AllowAll));
        let (_conn, ch, _rx) = channel("room:42");

        assert!(!table.unsubscribe("room:42", &ch));
        assert_eq!(table.topic_count(), 0);
    }

    #[test]
    fn test_last_operation_wins() {
        let table = SubscriptionTable::new(Arc::new(AllowAll));
        let (_conn, ch, _rx) = channel("room:1");
        let t = topic("room:1");

        // (op, subscribe?) sequences; the final state must follow the last op
        let sequences: [&[bool]; 5] = [
            &[true],
            &[true, true, false],
            &[false, true, false, true],
            &[true, false, false],
            &[false, false, true, true],
        ];

        for ops in sequences {
            for &subscribe in ops {
                if subscribe {
                    table.subscribe(&t, &ch).unwrap();
                } else {
                    table.unsubscribe(t.as_str(), &ch);
                }
            }
            let expected = *ops.last().unwrap();
            assert_eq!(table.is_active("room:1"), expected, "ops {:?}", ops);
            assert_eq!(ch.topics().contains(&"room:1".to_string()), expected);
            table.unsubscribe(t.as_str(), &ch);
        }
    }

    #[test]
    fn test_rejected_subscribe_leaves_table_unchanged() {
        let table = SubscriptionTable::new(Arc::new(DenyTopic("room:42")));
        let (_conn, ch, _rx) = channel("room:42");

        let err = table.subscribe(&topic("room:42"), &ch).unwrap_err();
        assert!(matches!(err, HubError::SubscriptionRejected { .. }));
        assert!(!table.is_active("room:42"));
        assert!(table.subscribers_of("room:42").is_empty());
        assert!(ch.topics().is_empty());
    }

    #[test]
    fn test_detach_removes_all_topics() {
        let table = SubscriptionTable::new(Arc::new(AllowAll));
        let (_conn, ch, _rx) = channel("multi");
        let (_other_conn, other, _other_rx) = channel("room:a");

        table.subscribe(&topic("room:a"), &ch).unwrap();
        table.subscribe(&topic("room:b"), &ch).unwrap();
        table.subscribe(&topic("room:a"), &other).unwrap();

        let mut idle = table.detach(&ch);
        idle.sort();
        assert_eq!(idle, vec!["room:b".to_string()]);

        assert_eq!(table.subscribers_of("room:a").len(), 1);
        assert!(!table.is_active("room:b"));

        let err = table.subscribe(&topic("room:c"), &ch).unwrap_err();
        assert!(matches!(err, HubError::ConnectionClosed(_)));
    }

    #[test]
    fn test_activity_transitions_reported() {
        let table = SubscriptionTable::new(Arc::new(AllowAll));
        let (tx, mut rx) = mpsc::unbounded_channel();
        table.watch_activity(tx);

        let (_c1, a, _r1) = channel("room:1");
        let (_c2, b, _r2) = channel("room:1");

        table.subscribe(&topic("room:1"), &a).unwrap();
        table.subscribe(&topic("room:1"), &b).unwrap();
        table.unsubscribe("room:1", &a);
        table.unsubscribe("room:1", &b);

        assert_eq!(rx.try_recv().unwrap(), TopicActivity::Active("room:1".to_string()));
        assert_eq!(rx.try_recv().unwrap(), TopicActivity::Idle("room:1".to_string()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_topic_does_not_keep_channel_alive() {
        let table = SubscriptionTable::new(Arc::new(AllowAll));
        let (_conn, ch, _rx) = channel("room:9");
        table.subscribe(&topic("room:9"), &ch).unwrap();

        drop(ch);
        assert!(table.subscribers_of("room:9").is_empty());
    }
}
