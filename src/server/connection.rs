//! Connection and channel state

use crate::auth::Identity;
use crate::error::{HubError, Result};
use crate::server::broadcaster::BroadcastMessage;
use crate::server::frames::ServerFrame;
use crate::server::handlers::ChannelHandler;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;
use uuid::Uuid;

/// Unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ConnectionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-unique channel identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

impl ChannelId {
    fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Liveness of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Subscription state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unsubscribed,
    Subscribing,
    Subscribed,
    Rejected,
}

/// Item on a connection's outbound queue, serialized by the writer task
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Frame(ServerFrame),
    Broadcast {
        channel: Arc<str>,
        message: Arc<BroadcastMessage>,
    },
    /// Send a disconnect frame and stop writing
    Close { reason: String },
}

impl OutboundMessage {
    pub fn into_frame(self) -> ServerFrame {
        match self {
            OutboundMessage::Frame(frame) => frame,
            OutboundMessage::Broadcast { channel, message } => ServerFrame::Message {
                channel: channel.to_string(),
                topic: Some(message.topic().to_string()),
                payload: message.payload().clone(),
            },
            OutboundMessage::Close { reason } => ServerFrame::Disconnect { reason },
        }
    }
}

/// Receiving half of a connection's outbound queue
pub type OutboundReceiver = mpsc::Receiver<OutboundMessage>;

/// One client's persistent transport session
pub struct Connection {
    id: ConnectionId,
    opened_at: Instant,
    identity: Arc<Identity>,
    state: Mutex<ConnectionState>,
    /// Released on close so the queue disconnects once drained
    tx: RwLock<Option<mpsc::Sender<OutboundMessage>>>,
    /// Open channels by name
    channels: Mutex<HashMap<String, Arc<Channel>>>,
}

impl Connection {
    pub fn new(id: ConnectionId, identity: Identity, tx: mpsc::Sender<OutboundMessage>) -> Self {
        Self {
            id,
            opened_at: Instant::now(),
            identity: Arc::new(identity),
            state: Mutex::new(ConnectionState::Connecting),
            tx: RwLock::new(Some(tx)),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Create a connection together with its bounded outbound queue
    pub fn with_queue(identity: Identity, capacity: usize) -> (Arc<Self>, OutboundReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        (Arc::new(Self::new(ConnectionId::new(), identity, tx)), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// CONNECTING -> OPEN
    pub fn mark_open(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            ConnectionState::Connecting => {
                *state = ConnectionState::Open;
                Ok(())
            }
            ConnectionState::Open => Ok(()),
            ConnectionState::Closing | ConnectionState::Closed => {
                Err(HubError::ConnectionClosed(self.id))
            }
        }
    }

    /// Move to CLOSING; returns false if teardown already started
    pub fn begin_close(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            ConnectionState::Closing | ConnectionState::Closed => false,
            _ => {
                *state = ConnectionState::Closing;
                true
            }
        }
    }

    pub fn mark_closed(&self) {
        *self.state.lock() = ConnectionState::Closed;
    }

    /// Put a message on the outbound queue without waiting for space
    pub fn enqueue(&self, msg: OutboundMessage) -> Result<()> {
        if !self.is_open() {
            return Err(HubError::ConnectionClosed(self.id));
        }

        let tx = self.tx.read();
        let tx = tx.as_ref().ok_or(HubError::ConnectionClosed(self.id))?;
        tx.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => HubError::QueueFull(self.id),
            TrySendError::Closed(_) => HubError::ConnectionClosed(self.id),
        })
    }

    pub fn enqueue_frame(&self, frame: ServerFrame) -> Result<()> {
        self.enqueue(OutboundMessage::Frame(frame))
    }

    /// Queue a goodbye if there is room, then release the sender. The
    /// receiver ends after draining whatever is left.
    pub(crate) fn close_queue(&self, reason: &str) {
        let Some(tx) = self.tx.write().take() else {
            return;
        };
        if tx
            .try_send(OutboundMessage::Close {
                reason: reason.to_string(),
            })
            .is_err()
        {
            debug!(conn_id = %self.id, "Outbound queue full, closing without disconnect frame");
        }
    }

    pub fn channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.lock().get(name).cloned()
    }

    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.lock().values().cloned().collect()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    pub(crate) fn insert_channel(&self, channel: Arc<Channel>) -> Option<Arc<Channel>> {
        self.channels.lock().insert(channel.name().to_string(), channel)
    }

    /// Remove `channel` only if it is still the one registered under its name
    pub(crate) fn remove_channel(&self, channel: &Channel) -> bool {
        let mut channels = self.channels.lock();
        match channels.get(channel.name()) {
            Some(current) if current.id() == channel.id() => {
                channels.remove(channel.name());
                true
            }
            _ => false,
        }
    }

    pub(crate) fn take_channels(&self) -> Vec<Arc<Channel>> {
        self.channels.lock().drain().map(|(_, c)| c).collect()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("client_id", &self.identity.client_id)
            .finish()
    }
}

/// The channel half of the subscription index
#[derive(Debug, Default)]
pub(crate) struct ChannelTopics {
    pub(crate) topics: BTreeSet<String>,
    /// Set once the channel is torn down; no further subscriptions
    pub(crate) detached: bool,
}

/// A named logical stream multiplexed over one connection
pub struct Channel {
    id: ChannelId,
    name: Arc<str>,
    connection_id: ConnectionId,
    connection: Weak<Connection>,
    params: Value,
    state: Mutex<ChannelState>,
    index: Mutex<ChannelTopics>,
    handler: Arc<dyn ChannelHandler>,
}

impl Channel {
    pub fn new(
        name: &str,
        connection: &Arc<Connection>,
        params: Value,
        handler: Arc<dyn ChannelHandler>,
    ) -> Self {
        Self {
            id: ChannelId::next(),
            name: Arc::from(name),
            connection_id: connection.id(),
            connection: Arc::downgrade(connection),
            params,
            state: Mutex::new(ChannelState::Unsubscribed),
            index: Mutex::new(ChannelTopics::default()),
            handler,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// The owning connection, if it is still alive
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.upgrade()
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    pub fn handler(&self) -> &Arc<dyn ChannelHandler> {
        &self.handler
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        *self.state.lock() = state;
    }

    /// Set the state, returning the previous one
    pub(crate) fn replace_state(&self, state: ChannelState) -> ChannelState {
        std::mem::replace(&mut *self.state.lock(), state)
    }

    /// Topics this channel currently streams from
    pub fn topics(&self) -> Vec<String> {
        self.index.lock().topics.iter().cloned().collect()
    }

    pub(crate) fn index(&self) -> MutexGuard<'_, ChannelTopics> {
        self.index.lock()
    }

    /// Enqueue a frame on the owning connection
    pub fn transmit(&self, frame: ServerFrame) -> Result<()> {
        let connection = self
            .connection()
            .ok_or(HubError::ConnectionClosed(self.connection_id))?;
        connection.enqueue_frame(frame)
    }

    /// Enqueue a broadcast on the owning connection
    pub fn deliver(&self, message: &Arc<BroadcastMessage>) -> Result<()> {
        let connection = self
            .connection()
            .ok_or(HubError::ConnectionClosed(self.connection_id))?;
        connection.enqueue(OutboundMessage::Broadcast {
            channel: self.name.clone(),
            message: message.clone(),
        })
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("connection_id", &self.connection_id)
            .field("state", &self.state())
            .finish()
    }
}
