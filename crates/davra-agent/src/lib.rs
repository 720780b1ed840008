//! The Davra device agent.
//!
//! Runs server-assigned jobs and standalone functions on the device, keeps the
//! server informed of what the device can do, and bridges device applications
//! to the server.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌─────────────────┐
//! │ local bus    │   │ cloud bus    │   │ tick (1s)       │
//! │ router::spawn│   │ router::spawn│   │ interval        │
//! └──────┬───────┘   └──────┬───────┘   └────────┬────────┘
//!        │   Intent         │   Intent           │
//!        ▼                  ▼                    ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                      AgentService                       │
//! │  ┌───────────────┐ ┌────────────────┐ ┌─────────────┐   │
//! │  │ Capability    │ │ Function       │ │ Job         │   │
//! │  │ Registry      │ │ Dispatcher     │ │ Manager     │   │
//! │  └───────────────┘ └───────┬────────┘ └─────────────┘   │
//! └────────────────────────────┼────────────────────────────┘
//!                              │ background built-ins
//!                              ▼
//!                   HandlerFinished intents
//! ```
//!
//! Job and function records live in a [`davra_store::StateStore`]; their
//! presence is the only notion of "running". Only the service mutates them.
//!
//! # Lifecycles
//!
//! | Record | Transitions |
//! |--------|-------------|
//! | Function | `running → completed \| failed` (forced `failed` on timeout) |
//! | Device assignment | `pending → running → completed \| failed` |
//!
//! See [`lifecycle`] for the transition rules.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod builtin;
pub mod config;
pub mod control_loop;
pub mod dispatcher;
pub mod error;
pub mod intent;
pub mod jobs;
pub mod lifecycle;
pub mod metrics;
pub mod process;
pub mod registry;
pub mod router;
pub mod service;
pub mod telemetry;

pub use builtin::{BuiltinFunction, HandlerOutcome};
pub use config::AgentSettings;
pub use control_loop::{TickPlan, TICK_PERIOD};
pub use dispatcher::{FunctionDispatcher, RunOutcome};
pub use error::{AgentError, Result};
pub use intent::{AgentHandle, Intent};
pub use jobs::{AcceptOutcome, JobManager};
pub use metrics::{FixedMetrics, HostMetrics, MetricsSource, SystemMetrics};
pub use registry::{CapabilityRegistry, Executor};
pub use router::Bus;
pub use service::{AgentService, ServiceParts};
