//! Authentication and authorization
//!
//! The hub never establishes sessions itself. An [`Authorizer`] turns the
//! transport handshake into an [`Identity`] once per connection, and decides
//! afterwards whether that identity may stream a given topic.
//!
//! Grant types:
//! - `read`: Stream broadcasts from matching topics
//! - `write`: Send data frames that handlers may republish to matching topics
//! - `all`: Shorthand for read+write

mod grants;
mod tokens;

pub use grants::{Grant, GrantSet, GrantType};
pub use tokens::{AdminKey, SubToken, Token, TokenError, SUB_TOKEN_PREFIX};

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;

/// What the transport knows about a client at handshake time
#[derive(Debug, Clone, Default)]
pub struct HandshakeContext {
    /// Bearer token from the query string or `Authorization` header
    pub token: Option<String>,
    pub remote_addr: Option<SocketAddr>,
    /// Remaining query parameters
    pub params: HashMap<String, String>,
}

impl HandshakeContext {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Self::default()
        }
    }
}

/// Identity attached to a connection, immutable once established
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    /// Client ID from the token
    pub client_id: Option<String>,
    pub grants: GrantSet,
    pub is_admin: bool,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn admin() -> Self {
        Self {
            is_admin: true,
            ..Self::default()
        }
    }

    pub fn can_read(&self, topic: &str) -> bool {
        self.is_admin || self.grants.can_read(topic)
    }

    pub fn can_write(&self, topic: &str) -> bool {
        self.is_admin || self.grants.can_write(topic)
    }
}

/// Handshake and subscription policy
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Establish the identity of a connecting client, or reject it
    async fn authorize(&self, handshake: &HandshakeContext) -> Result<Identity, String>;

    /// Decide whether `identity` may stream `topic`
    fn authorize_subscribe(&self, identity: &Identity, topic: &str) -> bool;

    /// Decide whether data sent by `identity` may be republished to `topic`
    fn authorize_publish(&self, identity: &Identity, topic: &str) -> bool {
        identity.can_write(topic)
    }
}

/// Accepts every handshake and every subscription
#[derive(Debug, Clone, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, handshake: &HandshakeContext) -> Result<Identity, String> {
        Ok(Identity {
            client_id: handshake.params.get("client_id").cloned(),
            ..Identity::anonymous()
        })
    }

    fn authorize_subscribe(&self, _identity: &Identity, _topic: &str) -> bool {
        true
    }

    fn authorize_publish(&self, _identity: &Identity, _topic: &str) -> bool {
        true
    }
}

/// Authorizes with signed `sub-` tokens and an optional admin key
#[derive(Debug, Clone)]
pub struct TokenAuthorizer {
    secret: Vec<u8>,
    admin_key: Option<AdminKey>,
}

impl TokenAuthorizer {
    pub fn new(secret: impl Into<Vec<u8>>, admin_key: Option<AdminKey>) -> Self {
        Self {
            secret: secret.into(),
            admin_key,
        }
    }
}

#[async_trait]
impl Authorizer for TokenAuthorizer {
    async fn authorize(&self, handshake: &HandshakeContext) -> Result<Identity, String> {
        let token = handshake.token.as_deref().ok_or("missing token")?;

        match Token::parse(token, &self.secret, self.admin_key.as_ref()) {
            Ok(Token::Admin) => Ok(Identity::admin()),
            Ok(Token::Sub(sub)) => Ok(Identity {
                client_id: Some(sub.client_id().to_string()),
                grants: sub.grants().clone(),
                is_admin: false,
            }),
            Err(e) => Err(e.to_string()),
        }
    }

    fn authorize_subscribe(&self, identity: &Identity, topic: &str) -> bool {
        identity.can_read(topic)
    }
}
