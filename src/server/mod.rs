//! Hub core
//!
//! Connection registry, topic subscription table, broadcaster and the
//! multiplexer that runs channels over each connection, plus the WebSocket
//! transport that drives them.

mod broadcaster;
mod connection;
pub mod frames;
mod handlers;
mod multiplexer;
mod registry;
mod subscriptions;
pub mod websocket;

pub use broadcaster::{BroadcastMessage, Broadcaster, DeliveryFailure, DeliveryReport, NodeId};
pub use connection::{
    Channel, ChannelId, ChannelState, Connection, ConnectionId, ConnectionState, OutboundMessage,
    OutboundReceiver,
};
pub use frames::{ClientFrame, ServerFrame};
pub use handlers::{ChannelContext, ChannelHandler, ChannelRoutes, StreamHandler};
pub use multiplexer::Multiplexer;
pub use registry::ConnectionRegistry;
pub use subscriptions::{Ack, SubscriptionTable, TopicActivity};
pub use websocket::{run_websocket_server, WsState};
