//! Core types and utilities for the Davra device agent.
//!
//! This crate provides the foundational types shared by every other crate:
//!
//! - **Identifiers**: Strongly-typed IDs for devices, jobs, device assignments and
//!   function invocations
//! - **Clock**: An injectable millisecond clock so timeout logic can be tested
//!   without sleeping
//!
//! # Example
//!
//! ```
//! use davra_core::{DeviceId, InvocationId};
//!
//! let device = DeviceId::new("3f1c2d8e-0000-4000-8000-000000000001").unwrap();
//! let invocation = InvocationId::generate();
//! assert_ne!(invocation.as_str(), device.as_str());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod clock;
pub mod ids;

pub use clock::{Clock, ManualClock, SystemClock};
pub use ids::{AssignmentId, DeviceId, IdError, InvocationId, JobId};

/// Version string reported to the server and to device applications.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
