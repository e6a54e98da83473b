//! Channel handlers
//!
//! Behaviour of a channel is supplied as a capability, not baked into the
//! channel type. [`ChannelRoutes`] picks the handler for an incoming
//! subscribe request by matching the channel name against topic patterns.

use crate::auth::Authorizer;
use crate::error::{HubError, Result};
use crate::server::broadcaster::Broadcaster;
use crate::server::connection::Channel;
use crate::topics::TopicPattern;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// What a handler can reach while serving one channel
pub struct ChannelContext<'a> {
    pub channel: &'a Arc<Channel>,
    pub broadcaster: &'a Broadcaster,
    pub authorizer: &'a dyn Authorizer,
}

/// Per-channel callbacks
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    /// Topics to stream once the subscription is accepted
    fn streams(&self, channel: &str, params: &Value) -> std::result::Result<Vec<String>, String> {
        let _ = params;
        Ok(vec![channel.to_string()])
    }

    /// Accept or reject a subscribe request
    async fn on_subscribe(&self, ctx: &ChannelContext<'_>) -> std::result::Result<(), String> {
        let _ = ctx;
        Ok(())
    }

    /// Inbound data frame for this channel
    async fn on_receive(&self, ctx: &ChannelContext<'_>, payload: Value) -> Result<()> {
        let _ = (ctx, payload);
        Ok(())
    }

    async fn on_unsubscribe(&self, ctx: &ChannelContext<'_>) {
        let _ = ctx;
    }
}

/// Streams from the channel name, or from `params.stream` when present.
///
/// With `republish` set, inbound data frames are broadcast to the channel's
/// topics if the identity may write to them.
#[derive(Debug, Clone, Default)]
pub struct StreamHandler {
    pub republish: bool,
}

impl StreamHandler {
    pub fn republishing() -> Self {
        Self { republish: true }
    }
}

#[async_trait]
impl ChannelHandler for StreamHandler {
    fn streams(&self, channel: &str, params: &Value) -> std::result::Result<Vec<String>, String> {
        match params.get("stream") {
            None | Some(Value::Null) => Ok(vec![channel.to_string()]),
            Some(Value::String(stream)) => Ok(vec![stream.clone()]),
            Some(Value::Array(streams)) => streams
                .iter()
                .map(|s| {
                    s.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| "stream names must be strings".to_string())
                })
                .collect(),
            Some(_) => Err("stream must be a string or a list of strings".to_string()),
        }
    }

    async fn on_receive(&self, ctx: &ChannelContext<'_>, payload: Value) -> Result<()> {
        if !self.republish {
            return Err(HubError::Protocol(format!(
                "channel '{}' does not accept data",
                ctx.channel.name()
            )));
        }

        let connection = ctx
            .channel
            .connection()
            .ok_or(HubError::ConnectionClosed(ctx.channel.connection_id()))?;

        for topic in ctx.channel.topics() {
            if !ctx.authorizer.authorize_publish(connection.identity(), &topic) {
                return Err(HubError::Protocol(format!("not allowed to publish to '{}'", topic)));
            }
            ctx.broadcaster.publish(&topic, payload.clone())?;
        }

        Ok(())
    }
}

/// Maps channel names to handlers; first matching route wins
#[derive(Clone, Default)]
pub struct ChannelRoutes {
    routes: Vec<(TopicPattern, Arc<dyn ChannelHandler>)>,
}

impl ChannelRoutes {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Route every channel name to `handler`
    pub fn catch_all(handler: Arc<dyn ChannelHandler>) -> Self {
        Self::new().route(TopicPattern::any(), handler)
    }

    pub fn route(mut self, pattern: TopicPattern, handler: Arc<dyn ChannelHandler>) -> Self {
        self.routes.push((pattern, handler));
        self
    }

    pub fn resolve(&self, channel: &str) -> Option<Arc<dyn ChannelHandler>> {
        self.routes
            .iter()
            .find(|(pattern, _)| pattern.matches(channel))
            .map(|(_, handler)| handler.clone())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
