//! Message bus error types.

use thiserror::Error;

/// A result type using `BusError`.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur on either message bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// An inbound payload is not a message the agent can read.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// An outbound message could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),

    /// The broker client refused the publish.
    #[error("publish failed: {0}")]
    Publish(String),

    /// A broker address could not be parsed.
    #[error("invalid broker address: {0}")]
    InvalidAddress(String),
}
