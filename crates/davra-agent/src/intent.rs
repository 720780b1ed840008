//! Requests submitted to the agent service.
//!
//! Bus adapters and background handlers never touch agent state. They send an
//! [`Intent`] through an [`AgentHandle`] and the service applies it in order.

use davra_bus::{CloudMessage, LocalMessage, Origin};
use davra_core::InvocationId;
use tokio::sync::mpsc;

use crate::builtin::HandlerOutcome;
use crate::error::{AgentError, Result};

/// Default intent queue size.
pub const DEFAULT_CAPACITY: usize = 256;

/// Something for the service to do.
#[derive(Debug)]
pub enum Intent {
    /// Requests received on the local bus.
    Local {
        /// Who published them.
        origin: Origin,
        /// Requests, in handling order.
        messages: Vec<LocalMessage>,
    },
    /// Triggers received on the cloud bus.
    Cloud(Vec<CloudMessage>),
    /// A background built-in handler finished.
    HandlerFinished {
        /// Invocation the handler ran for.
        invocation_id: InvocationId,
        /// What it produced.
        outcome: HandlerOutcome,
    },
    /// Stop the service.
    Shutdown,
}

/// Sending side of the service's intent queue.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    tx: mpsc::Sender<Intent>,
}

impl AgentHandle {
    /// Create a handle and the receiver the service consumes.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Intent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue an intent.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::ShuttingDown` if the service has stopped.
    pub async fn submit(&self, intent: Intent) -> Result<()> {
        self.tx
            .send(intent)
            .await
            .map_err(|_| AgentError::ShuttingDown)
    }

    /// Ask the service to stop.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::ShuttingDown` if the service has already stopped.
    pub async fn shutdown(&self) -> Result<()> {
        self.submit(Intent::Shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submitted_intents_arrive_in_order() {
        let (handle, mut rx) = AgentHandle::channel(4);
        handle.submit(Intent::Cloud(Vec::new())).await.unwrap();
        handle.shutdown().await.unwrap();

        assert!(matches!(rx.recv().await, Some(Intent::Cloud(_))));
        assert!(matches!(rx.recv().await, Some(Intent::Shutdown)));
    }

    #[tokio::test]
    async fn closed_queue_reports_shutdown() {
        let (handle, rx) = AgentHandle::channel(1);
        drop(rx);
        assert!(matches!(
            handle.shutdown().await,
            Err(AgentError::ShuttingDown)
        ));
    }
}
