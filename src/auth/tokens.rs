//! Token types and validation
//!
//! - `sub-` : Stateless subscriber token (self-contained, HMAC signed)
//! - anything else is compared against the admin key, when one is configured

use crate::auth::grants::GrantSet;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const SUB_TOKEN_PREFIX: &str = "sub-";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token format")]
    InvalidFormat,

    #[error("invalid token prefix: expected '{expected}', got '{got}'")]
    InvalidPrefix { expected: String, got: String },

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("token expired")]
    Expired,

    #[error("token decode error: {0}")]
    DecodeError(String),
}

/// Admin key for full access
#[derive(Clone)]
pub struct AdminKey {
    key: String,
}

impl AdminKey {
    pub fn new(key: String) -> Self {
        Self { key }
    }

    /// Constant-time comparison against a presented token
    pub fn matches(&self, token: &str) -> bool {
        if token.len() != self.key.len() {
            return false;
        }

        let mut result = 0u8;
        for (a, b) in token.bytes().zip(self.key.bytes()) {
            result |= a ^ b;
        }
        result == 0
    }
}

impl fmt::Debug for AdminKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AdminKey([REDACTED])")
    }
}

/// Payload stored in a subscriber token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTokenPayload {
    pub client_id: String,
    pub grants: GrantSet,
    /// Expiry as unix seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
}

/// Truncated signature length in bytes
const SIGNATURE_BYTES: usize = 16;

fn mac_over(secret: &[u8], data: &str) -> Result<HmacSha256, TokenError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| TokenError::InvalidSignature)?;
    mac.update(data.as_bytes());
    Ok(mac)
}

fn sign(secret: &[u8], data: &str) -> Result<String, TokenError> {
    let signature = mac_over(secret, data)?.finalize().into_bytes();
    Ok(URL_SAFE_NO_PAD.encode(&signature[..SIGNATURE_BYTES]))
}

fn verify(secret: &[u8], data: &str, signature_b64: &str) -> Result<(), TokenError> {
    let signature = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| TokenError::InvalidSignature)?;
    if signature.len() != SIGNATURE_BYTES {
        return Err(TokenError::InvalidSignature);
    }
    mac_over(secret, data)?
        .verify_truncated_left(&signature)
        .map_err(|_| TokenError::InvalidSignature)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A stateless subscriber token
#[derive(Debug, Clone)]
pub struct SubToken {
    token: String,
    payload: SubTokenPayload,
}

impl SubToken {
    /// Create a signed token, optionally expiring `ttl_secs` from now
    pub fn create(
        client_id: String,
        grants: GrantSet,
        ttl_secs: Option<u64>,
        secret: &[u8],
    ) -> Result<Self, TokenError> {
        let payload = SubTokenPayload {
            client_id,
            grants,
            exp: ttl_secs.map(|ttl| now_secs() + ttl),
        };
        let payload_json =
            serde_json::to_vec(&payload).map_err(|e| TokenError::DecodeError(e.to_string()))?;
        let payload_b64 = URL_SAFE_NO_PAD.encode(&payload_json);
        let signature_b64 = sign(secret, &payload_b64)?;

        let token = format!("{}{}.{}", SUB_TOKEN_PREFIX, payload_b64, signature_b64);

        Ok(Self { token, payload })
    }

    /// Parse and verify a subscriber token
    pub fn parse(token: &str, secret: &[u8]) -> Result<Self, TokenError> {
        let content = token
            .strip_prefix(SUB_TOKEN_PREFIX)
            .ok_or_else(|| TokenError::InvalidPrefix {
                expected: SUB_TOKEN_PREFIX.to_string(),
                got: token.chars().take(4).collect(),
            })?;

        let (payload_b64, signature_b64) =
            content.split_once('.').ok_or(TokenError::InvalidFormat)?;

        if signature_b64.contains('.') {
            return Err(TokenError::InvalidFormat);
        }

        verify(secret, payload_b64, signature_b64)?;

        let payload_json = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|e| TokenError::DecodeError(e.to_string()))?;

        let payload: SubTokenPayload = serde_json::from_slice(&payload_json)
            .map_err(|e| TokenError::DecodeError(e.to_string()))?;

        if payload.exp.is_some_and(|exp| exp <= now_secs()) {
            return Err(TokenError::Expired);
        }

        Ok(Self {
            token: token.to_string(),
            payload,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.token
    }

    pub fn client_id(&self) -> &str {
        &self.payload.client_id
    }

    pub fn grants(&self) -> &GrantSet {
        &self.payload.grants
    }

    pub fn expires_at(&self) -> Option<u64> {
        self.payload.exp
    }
}

impl fmt::Display for SubToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token)
    }
}

/// Unified token type
#[derive(Debug, Clone)]
pub enum Token {
    Admin,
    Sub(SubToken),
}

impl Token {
    pub fn parse(token: &str, secret: &[u8], admin_key: Option<&AdminKey>) -> Result<Self, TokenError> {
        if let Some(admin) = admin_key {
            if admin.matches(token) {
                return Ok(Token::Admin);
            }
        }

        if token.starts_with(SUB_TOKEN_PREFIX) {
            return SubToken::parse(token, secret).map(Token::Sub);
        }

        Err(TokenError::InvalidFormat)
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Token::Admin)
    }
}
