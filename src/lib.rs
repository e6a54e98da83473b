//! Cablecast - real-time publish/subscribe broadcast hub
//!
//! Clients hold one persistent WebSocket each and open many logical channels
//! over it. Every payload published to a topic reaches all channels streaming
//! from that topic, on this process and, through a relay bus, on every other
//! process of the deployment.

pub mod auth;
pub mod config;
pub mod error;
pub mod hub;
pub mod relay;
pub mod server;
pub mod topics;

pub use auth::{AllowAll, Authorizer, HandshakeContext, Identity, TokenAuthorizer};
pub use config::{HubConfig, RelayConfig};
pub use error::{HubError, Result};
pub use hub::Hub;
pub use topics::{TopicName, TopicPattern};
