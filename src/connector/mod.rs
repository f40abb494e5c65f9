//! Connector framework
//!
//! Sources and destinations are tagged variants over a small, fixed
//! capability set: a source can `start`/`stop` and hands messages to the
//! pipeline through [`MessageReceiver`]; a destination can `dispatch`.
//! Poll-driven sources are additionally gated by the cluster polling lease.

pub mod channel;
pub mod file;
pub mod script;

pub use channel::{ChannelResolver, ChannelWriterDestination};
pub use file::{FileReaderSource, FileWriterDestination};
pub use script::ScriptDestination;

use crate::cluster::LeaseHandle;
use crate::engine::ChannelSignal;
use crate::error::Result;
use crate::model::{ConnectorMessage, RawMessage, Response};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// The pipeline-side of the source hand-off point
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    /// Called by a source connector for each new message; returns once the
    /// pipeline has persisted the message and driven it to completion (or to
    /// its queues)
    async fn receive(&self, raw: RawMessage) -> Result<ReceiveOutcome>;
}

/// What the pipeline reports back to the source connector
#[derive(Debug, Clone)]
pub struct ReceiveOutcome {
    pub message_id: i64,
    /// Response to relay to the caller, when the source is configured to
    /// respond after processing
    pub response: Option<Response>,
}

/// Everything a running source task needs from its channel
pub struct SourceContext {
    pub channel_id: String,
    pub channel_name: String,
    pub receiver: Arc<dyn MessageReceiver>,
    /// Present for poll-driven sources in a cluster; checked before each poll
    pub lease: Option<Arc<LeaseHandle>>,
    pub signal: watch::Receiver<ChannelSignal>,
}

/// A source connector driver
#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this source polls (and therefore needs the lease)
    fn is_polling(&self) -> bool;

    /// Spawn the connector's task(s); returns once they are running
    async fn start(&self, ctx: SourceContext) -> Result<()>;

    /// Stop the connector's task(s); returns once they have exited
    async fn stop(&self) -> Result<()>;
}

/// A destination connector driver
#[async_trait]
pub trait DestinationConnector: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver one payload. A transport-level failure is an `Err` and will
    /// be retried per queue policy; an `Ok` response with an error status
    /// means the remote accepted the dispatch but rejected the message.
    async fn dispatch(&self, cm: &ConnectorMessage, payload: &str) -> Result<Response>;

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

/// Transport seam under dispatching destinations, so one destination type
/// can deliver over substitutable transports
#[async_trait]
pub trait DispatchTransport: Send + Sync {
    /// Send one payload to `target`; returns the acknowledgement body
    async fn send(&self, target: &str, payload: &str) -> Result<String>;
}

/// Destination that delivers through a named [`DispatchTransport`]
pub struct TransportDestination {
    name: String,
    target: String,
    transport: Arc<dyn DispatchTransport>,
    timeout: Duration,
}

impl TransportDestination {
    pub fn new(
        name: impl Into<String>,
        target: impl Into<String>,
        transport: Arc<dyn DispatchTransport>,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            transport,
            timeout,
        }
    }
}

#[async_trait]
impl DestinationConnector for TransportDestination {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dispatch(&self, _cm: &ConnectorMessage, payload: &str) -> Result<Response> {
        let send = self.transport.send(&self.target, payload);
        match tokio::time::timeout(self.timeout, send).await {
            Ok(Ok(ack)) => Ok(Response::sent(ack)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(crate::error::EngineError::Transport(format!(
                "send to {} timed out after {:?}",
                self.target, self.timeout
            ))),
        }
    }
}
