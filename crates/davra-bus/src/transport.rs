//! Outbound side of a bus.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::envelope::Envelope;
use crate::error::Result;

/// Something that can deliver an encoded payload to a topic.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `BusError::Publish` if the client refuses the message.
    async fn send(&self, payload: Vec<u8>) -> Result<()>;
}

/// Transport used when no broker is configured. Drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport;

#[async_trait]
impl Transport for NullTransport {
    async fn send(&self, payload: Vec<u8>) -> Result<()> {
        debug!(bytes = payload.len(), "No local broker, message dropped");
        Ok(())
    }
}

/// Publishes envelopes tagged as coming from this agent.
#[derive(Clone)]
pub struct AgentPublisher {
    transport: Arc<dyn Transport>,
    agent_version: String,
}

impl AgentPublisher {
    /// Wrap a transport.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, agent_version: impl Into<String>) -> Self {
        Self {
            transport,
            agent_version: agent_version.into(),
        }
    }

    /// A publisher that goes nowhere.
    #[must_use]
    pub fn disconnected(agent_version: impl Into<String>) -> Self {
        Self::new(Arc::new(NullTransport), agent_version)
    }

    /// Stamp the origin tag and publish.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or publishing fails.
    pub async fn publish(&self, mut envelope: Envelope) -> Result<()> {
        envelope.stamp_agent(&self.agent_version);
        self.transport.send(envelope.encode()?).await
    }
}
