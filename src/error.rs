//! Error types for the hub

use crate::server::ConnectionId;
use crate::topics::TopicError;
use thiserror::Error;

/// Errors surfaced by the hub core
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    /// The authorizer refused the transport handshake
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// A channel subscription was refused; the connection stays open
    #[error("subscription to '{channel}' rejected: {reason}")]
    SubscriptionRejected { channel: String, reason: String },

    /// The target connection is closing or closed
    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    /// The connection's outbound queue is full
    #[error("outbound queue full for connection {0}")]
    QueueFull(ConnectionId),

    /// A connection id was registered twice (id generator bug)
    #[error("duplicate connection id {0}")]
    DuplicateId(ConnectionId),

    #[error("connection {0} not found")]
    NotFound(ConnectionId),

    #[error("no handler routes channel '{0}'")]
    UnknownChannel(String),

    #[error("invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// The cross-process bus cannot be reached
    #[error("bus unavailable: {0}")]
    BusUnavailable(String),
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        HubError::Serialization(e.to_string())
    }
}

/// Result type for hub operations
pub type Result<T> = std::result::Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_error_display_subscription_rejected() {
        let err = HubError::SubscriptionRejected {
            channel: "room:42".to_string(),
            reason: "denied".to_string(),
        };
        assert_eq!(err.to_string(), "subscription to 'room:42' rejected: denied");
    }

    #[test]
    fn test_error_display_connection_closed() {
        let id = ConnectionId::from(Uuid::nil());
        let err = HubError::ConnectionClosed(id);
        assert_eq!(
            err.to_string(),
            "connection 00000000-0000-0000-0000-000000000000 is closed"
        );
    }

    #[test]
    fn test_error_from_topic_error() {
        let err: HubError = TopicError::Empty.into();
        assert!(matches!(err, HubError::InvalidTopic(TopicError::Empty)));
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<String>("not valid json").unwrap_err();
        let err: HubError = json_err.into();
        assert!(err.to_string().starts_with("serialization error:"));
    }
}
