//! Transport multiplexer
//!
//! Owns the per-client connection lifecycle and routes logical channel frames
//! over it. Transport specifics stay outside: a transport calls
//! [`Multiplexer::accept_connection`], feeds decoded frames to
//! [`Multiplexer::handle_frame`], drains the returned outbound queue, and
//! calls [`Multiplexer::close_connection`] on teardown.

use crate::auth::{Authorizer, HandshakeContext};
use crate::error::{HubError, Result};
use crate::server::broadcaster::Broadcaster;
use crate::server::connection::{
    Channel, ChannelState, Connection, ConnectionId, OutboundReceiver,
};
use crate::server::frames::{ClientFrame, ServerFrame};
use crate::server::handlers::{ChannelContext, ChannelRoutes};
use crate::server::registry::ConnectionRegistry;
use crate::server::subscriptions::SubscriptionTable;
use crate::topics::TopicName;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct Multiplexer {
    registry: Arc<ConnectionRegistry>,
    table: Arc<SubscriptionTable>,
    broadcaster: Arc<Broadcaster>,
    routes: ChannelRoutes,
    authorizer: Arc<dyn Authorizer>,
    outbound_capacity: usize,
}

impl Multiplexer {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        table: Arc<SubscriptionTable>,
        broadcaster: Arc<Broadcaster>,
        routes: ChannelRoutes,
        authorizer: Arc<dyn Authorizer>,
        outbound_capacity: usize,
    ) -> Self {
        Self {
            registry,
            table,
            broadcaster,
            routes,
            authorizer,
            outbound_capacity,
        }
    }

    fn context<'a>(&'a self, channel: &'a Arc<Channel>) -> ChannelContext<'a> {
        ChannelContext {
            channel,
            broadcaster: &self.broadcaster,
            authorizer: self.authorizer.as_ref(),
        }
    }

    /// Authorize a handshake and open a connection for it
    pub async fn accept_connection(
        &self,
        handshake: HandshakeContext,
    ) -> Result<(Arc<Connection>, OutboundReceiver)> {
        let identity = self
            .authorizer
            .authorize(&handshake)
            .await
            .map_err(HubError::HandshakeRejected)?;

        let (tx, rx) = mpsc::channel(self.outbound_capacity);
        let connection = Arc::new(Connection::new(ConnectionId::new(), identity, tx));

        self.registry.register(connection.clone())?;
        connection.mark_open()?;
        connection.enqueue_frame(ServerFrame::Welcome {
            connection_id: connection.id().to_string(),
        })?;

        info!(
            conn_id = %connection.id(),
            client_id = ?connection.identity().client_id,
            remote_addr = ?handshake.remote_addr,
            "Connection opened"
        );

        Ok((connection, rx))
    }

    /// Open a channel: subscribe it to its handler's topics, then confirm.
    ///
    /// Any failure is answered with a `reject_subscription` frame and leaves
    /// no subscription behind.
    pub async fn open_channel(
        &self,
        connection: &Arc<Connection>,
        name: &str,
        params: Value,
    ) -> Result<Arc<Channel>> {
        match self.try_open_channel(connection, name, params).await {
            Ok(channel) => Ok(channel),
            Err(HubError::ConnectionClosed(id)) => Err(HubError::ConnectionClosed(id)),
            Err(e) => {
                let reason = match &e {
                    HubError::SubscriptionRejected { reason, .. } => reason.clone(),
                    other => other.to_string(),
                };
                debug!(conn_id = %connection.id(), channel = name, reason = %reason, "Subscription rejected");
                let _ = connection.enqueue_frame(ServerFrame::RejectSubscription {
                    channel: name.to_string(),
                    reason: reason.clone(),
                });
                Err(HubError::SubscriptionRejected {
                    channel: name.to_string(),
                    reason,
                })
            }
        }
    }

    async fn try_open_channel(
        &self,
        connection: &Arc<Connection>,
        name: &str,
        params: Value,
    ) -> Result<Arc<Channel>> {
        if !connection.is_open() {
            return Err(HubError::ConnectionClosed(connection.id()));
        }

        TopicName::parse(name)?;

        if let Some(existing) = connection.channel(name) {
            if existing.state() == ChannelState::Subscribed {
                connection.enqueue_frame(ServerFrame::ConfirmSubscription {
                    channel: name.to_string(),
                })?;
                return Ok(existing);
            }
        }

        let handler = self
            .routes
            .resolve(name)
            .ok_or_else(|| HubError::UnknownChannel(name.to_string()))?;

        let channel = Arc::new(Channel::new(name, connection, params, handler.clone()));
        channel.set_state(ChannelState::Subscribing);

        let rejected = |reason: String| HubError::SubscriptionRejected {
            channel: name.to_string(),
            reason,
        };

        handler
            .on_subscribe(&self.context(&channel))
            .await
            .map_err(rejected)?;

        let topics = handler
            .streams(name, channel.params())
            .map_err(rejected)?
            .iter()
            .map(|t| TopicName::parse(t))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        // Authorize everything before touching the table
        for topic in &topics {
            self.table.authorize(topic, &channel)?;
        }

        if let Some(previous) = connection.insert_channel(channel.clone()) {
            self.retire(&previous).await;
        }

        if let Err(e) = self.confirm_and_stream(connection, &channel, &topics) {
            self.table.detach(&channel);
            connection.remove_channel(&channel);
            channel.set_state(ChannelState::Rejected);
            return Err(e);
        }

        // Lost a race with close_connection: its cascade may have missed us
        if !connection.is_open() {
            self.table.detach(&channel);
            connection.remove_channel(&channel);
            channel.set_state(ChannelState::Unsubscribed);
            return Err(HubError::ConnectionClosed(connection.id()));
        }

        channel.set_state(ChannelState::Subscribed);
        debug!(conn_id = %connection.id(), channel = name, topics = topics.len(), "Channel subscribed");

        Ok(channel)
    }

    /// Confirm first so no broadcast can overtake the confirmation
    fn confirm_and_stream(
        &self,
        connection: &Connection,
        channel: &Arc<Channel>,
        topics: &[TopicName],
    ) -> Result<()> {
        connection.enqueue_frame(ServerFrame::ConfirmSubscription {
            channel: channel.name().to_string(),
        })?;

        for topic in topics {
            self.table.subscribe(topic, channel)?;
        }
        Ok(())
    }

    /// Unsubscribe a channel from all topics and drop it from its connection
    pub async fn close_channel(&self, channel: &Arc<Channel>) {
        if let Some(connection) = channel.connection() {
            connection.remove_channel(channel);
            let _ = connection.enqueue_frame(ServerFrame::Unsubscribed {
                channel: channel.name().to_string(),
            });
        }

        let topics = self.table.topics_of(channel);
        self.retire(channel).await;
        debug!(
            conn_id = %channel.connection_id(),
            channel = channel.name(),
            topics = ?topics,
            "Channel closed"
        );
    }

    /// Detach a channel from every topic; only a confirmed channel gets its
    /// `on_unsubscribe` hook
    async fn retire(&self, channel: &Arc<Channel>) {
        self.table.detach(channel);
        if channel.replace_state(ChannelState::Unsubscribed) == ChannelState::Subscribed {
            channel.handler().on_unsubscribe(&self.context(channel)).await;
        }
    }

    /// Send a direct (non-broadcast) payload on one channel
    pub fn send(&self, channel: &Channel, payload: Value) -> Result<()> {
        channel.transmit(ServerFrame::Message {
            channel: channel.name().to_string(),
            topic: None,
            payload,
        })
    }

    /// Route one inbound frame to the channel it names
    pub async fn handle_frame(&self, connection: &Arc<Connection>, frame: ClientFrame) -> Result<()> {
        match frame {
            ClientFrame::Subscribe { channel, payload } => {
                self.open_channel(connection, &channel, payload).await?;
            }
            ClientFrame::Unsubscribe { channel } => match connection.channel(&channel) {
                Some(ch) => self.close_channel(&ch).await,
                None => return Err(self.report(connection, channel, "unknown subscription")),
            },
            ClientFrame::Data { channel, payload } => {
                let ch = match connection.channel(&channel) {
                    Some(ch) if ch.state() == ChannelState::Subscribed => ch,
                    _ => return Err(self.report(connection, channel, "unknown subscription")),
                };

                if let Err(e) = ch.handler().on_receive(&self.context(&ch), payload).await {
                    let _ = connection.enqueue_frame(ServerFrame::Error {
                        channel: Some(channel),
                        message: e.to_string(),
                    });
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    fn report(&self, connection: &Connection, channel: String, message: &str) -> HubError {
        let err = HubError::Protocol(format!("{}: {}", message, channel));
        let _ = connection.enqueue_frame(ServerFrame::Error {
            channel: Some(channel),
            message: message.to_string(),
        });
        err
    }

    /// Report an undecodable frame back to the client
    pub fn reject_frame(&self, connection: &Connection, error: &HubError) {
        let _ = connection.enqueue_frame(ServerFrame::Error {
            channel: None,
            message: error.to_string(),
        });
    }

    /// Tear a connection down: OPEN -> CLOSING -> CLOSED. Idempotent.
    pub async fn close_connection(&self, connection: &Arc<Connection>, reason: &str) {
        if !connection.begin_close() {
            return;
        }
        connection.close_queue(reason);

        let channels = self.registry.deregister(connection.id());
        for channel in &channels {
            self.retire(channel).await;
        }

        connection.mark_closed();

        let lifetime = connection.opened_at().elapsed();
        info!(
            conn_id = %connection.id(),
            channels = channels.len(),
            lifetime_ms = lifetime.as_millis() as u64,
            reason = reason,
            "Connection closed"
        );
    }

    /// Close every live connection
    pub async fn close_all(&self, reason: &str) {
        let connections = self.registry.connections();
        if !connections.is_empty() {
            warn!(count = connections.len(), reason = reason, "Closing all connections");
        }
        for connection in connections {
            self.close_connection(&connection, reason).await;
        }
    }
}
