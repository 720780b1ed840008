//! Error types for the agent.
//!
//! Every failure inside the agent is one of these. None of them is fatal to the
//! process: the service logs the error of a failed step and moves on.

use davra_api::ApiError;
use davra_bus::BusError;
use davra_store::StoreError;
use thiserror::Error;

/// A result type using `AgentError`.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors that can occur in agent operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Persisted state could not be read or written.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A server call failed.
    #[error("server error: {0}")]
    Api(#[from] ApiError),

    /// A bus message could not be decoded or published.
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// The configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// An external process could not be started.
    #[error("process error: {0}")]
    Process(String),

    /// A status change the state machine does not allow.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: &'static str,
        /// Requested status.
        to: &'static str,
    },

    /// The service stopped accepting intents.
    #[error("agent is shutting down")]
    ShuttingDown,
}

impl AgentError {
    /// Returns `true` if the failure is expected to clear on its own.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Api(e) => e.is_retriable(),
            Self::Bus(BusError::Publish(_)) => true,
            _ => false,
        }
    }
}
