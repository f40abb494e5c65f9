//! Channel-to-channel delivery
//!
//! A channel writer destination references its target channel by id string
//! only; the engine registry resolves it at dispatch time. Keeping the
//! reference indirect breaks the config-level cycle between channels that
//! route to each other.

use super::DestinationConnector;
use crate::error::{EngineError, Result};
use crate::model::{ConnectorMessage, RawMessage, Response};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// Resolves a channel id to its running receive endpoint
#[async_trait]
pub trait ChannelResolver: Send + Sync {
    /// Deliver a raw message to the named channel's source hand-off point;
    /// fails when the channel is not deployed and started
    async fn dispatch_to_channel(&self, channel_id: &str, raw: RawMessage) -> Result<Response>;
}

/// Destination that writes into another channel on the same engine
pub struct ChannelWriterDestination {
    name: String,
    target_channel_id: String,
    resolver: Arc<dyn ChannelResolver>,
}

impl ChannelWriterDestination {
    pub fn new(
        name: impl Into<String>,
        target_channel_id: impl Into<String>,
        resolver: Arc<dyn ChannelResolver>,
    ) -> Self {
        Self {
            name: name.into(),
            target_channel_id: target_channel_id.into(),
            resolver,
        }
    }
}

#[async_trait]
impl DestinationConnector for ChannelWriterDestination {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dispatch(&self, cm: &ConnectorMessage, payload: &str) -> Result<Response> {
        let raw = RawMessage::new(payload)
            .with_source_entry("sourceChannelId", json!(cm.channel_id.clone()))
            .with_source_entry("sourceMessageId", json!(cm.message_id));
        self.resolver
            .dispatch_to_channel(&self.target_channel_id, raw)
            .await
            .map_err(|e| match e {
                // a stopped or missing target is a transport condition: the
                // queue may retry it once the target comes back
                EngineError::Configuration(msg) => EngineError::Transport(msg),
                other => other,
            })
    }
}
