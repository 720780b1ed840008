//! Job and function state machines.
//!
//! ```text
//!   Function:   running ──► completed
//!                  │
//!                  └──────► failed        (handler failure, timeout)
//!
//!   Assignment: pending ──► running ──► completed
//!                  │           │
//!                  └───────────┴──────► failed
//! ```
//!
//! Terminal states have no outgoing edges. A record leaves the store only once
//! it is terminal and its outcome has been delivered.

use davra_store::{AssignmentStatus, FunctionStatus};

use crate::error::{AgentError, Result};

/// Check a function status change.
#[must_use]
pub const fn is_valid_function_transition(from: FunctionStatus, to: FunctionStatus) -> bool {
    use FunctionStatus::{Completed, Failed, Running};

    matches!((from, to), (Running, Completed | Failed))
}

/// Check a device-assignment status change.
#[must_use]
pub const fn is_valid_assignment_transition(from: AssignmentStatus, to: AssignmentStatus) -> bool {
    use AssignmentStatus::{Completed, Failed, Pending, Running, Unknown};

    matches!(
        (from, to),
        // Accepting a job; the server may send statuses this agent does not know
        (Pending | Unknown, Running)
            // Dispatch failure before anything ran
            | (Pending | Unknown, Failed)
            | (Running, Completed | Failed)
    )
}

/// Validates a function status change.
///
/// # Errors
///
/// Returns `AgentError::InvalidTransition` if the change is not allowed.
pub fn validate_function_transition(
    from: FunctionStatus,
    to: FunctionStatus,
) -> Result<FunctionStatus> {
    if is_valid_function_transition(from, to) {
        Ok(to)
    } else {
        Err(AgentError::InvalidTransition {
            from: from.as_str(),
            to: to.as_str(),
        })
    }
}

/// Validates a device-assignment status change.
///
/// # Errors
///
/// Returns `AgentError::InvalidTransition` if the change is not allowed.
pub fn validate_assignment_transition(
    from: AssignmentStatus,
    to: AssignmentStatus,
) -> Result<AssignmentStatus> {
    if is_valid_assignment_transition(from, to) {
        Ok(to)
    } else {
        Err(AgentError::InvalidTransition {
            from: from.as_str(),
            to: to.as_str(),
        })
    }
}
