//! Message routing between the agent, device applications and the server.
//!
//! Two independent MQTT channels carry JSON envelopes:
//!
//! ```text
//!   Device apps ──► /agent ◄──┐                 ┌──► devices/{id} ◄── Server
//!                             │                 │
//!                      ┌──────┴─────────────────┴──────┐
//!                      │            Agent              │
//!                      │  local::decode  cloud::decode │
//!                      │  AgentPublisher (origin tag)  │
//!                      └───────────────────────────────┘
//! ```
//!
//! Every envelope the agent publishes is stamped with its origin. Inbound
//! decoding turns the agent's own looped-back traffic into
//! [`Decoded::OwnEcho`], so nothing the agent sends can trigger its own
//! handlers.
//!
//! # Testing
//!
//! Enable the `test-utils` feature for [`RecordingTransport`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod cloud;
pub mod envelope;
pub mod error;
pub mod local;
pub mod mqtt;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use cloud::CloudMessage;
pub use envelope::{keys, Decoded, Envelope, Origin};
pub use error::{BusError, Result};
pub use local::{FinishedFunctionReport, LocalMessage};
pub use mqtt::{BrokerAddress, ChannelOptions, MqttChannel};
pub use transport::{AgentPublisher, NullTransport, Transport};

#[cfg(any(test, feature = "test-utils"))]
pub use mock::RecordingTransport;
