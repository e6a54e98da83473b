//! Client-facing wire protocol
//!
//! Every frame is a JSON object tagged by `type`. Client frames name the
//! logical channel they belong to, so one socket carries many channels
//! without any per-topic schema.

use crate::error::{HubError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames from client to server
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Open a channel; `payload` carries the subscribe params
    Subscribe {
        channel: String,
        #[serde(default)]
        payload: Value,
    },
    /// Close a channel
    Unsubscribe { channel: String },
    /// Data for the channel's handler
    Data {
        channel: String,
        #[serde(default)]
        payload: Value,
    },
}

impl ClientFrame {
    pub fn channel(&self) -> &str {
        match self {
            ClientFrame::Subscribe { channel, .. }
            | ClientFrame::Unsubscribe { channel }
            | ClientFrame::Data { channel, .. } => channel,
        }
    }
}

/// Frames from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Handshake accepted
    Welcome { connection_id: String },
    /// Heartbeat, unix seconds
    Ping { message: u64 },
    ConfirmSubscription { channel: String },
    RejectSubscription { channel: String, reason: String },
    Unsubscribed { channel: String },
    /// Broadcast (`topic` set) or direct transmission on a channel
    Message {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
        payload: Value,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        message: String,
    },
    /// Server is closing the connection
    Disconnect { reason: String },
}

/// Decode one inbound text frame
pub fn decode_frame(text: &str) -> Result<ClientFrame> {
    serde_json::from_str(text).map_err(|e| HubError::Protocol(e.to_string()))
}

pub fn encode_frame(frame: &ServerFrame) -> Result<String> {
    Ok(serde_json::to_string(frame)?)
}
