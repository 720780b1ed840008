//! Identifier types for the Davra agent.
//!
//! Devices, jobs and device assignments are identified by opaque strings issued by
//! the server (UUIDs in practice, but the agent never relies on the format). A
//! function invocation identifier is either supplied by the caller or generated
//! locally as a UUID v4.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Create an identifier from a non-empty string.
            ///
            /// # Errors
            ///
            /// Returns [`IdError::Empty`] if the string is empty or whitespace.
            pub fn new(value: impl Into<String>) -> Result<Self, IdError> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(IdError::Empty);
                }
                Ok(Self(value))
            }

            /// Return the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id! {
    /// Server-issued device identifier (the `UUID` configuration key).
    DeviceId
}

string_id! {
    /// Server-issued job identifier.
    JobId
}

string_id! {
    /// Identifier of the device-assignment portion of a job.
    AssignmentId
}

string_id! {
    /// Globally-unique identifier of one function invocation.
    ///
    /// Travels on the wire as `functionParameterValues.functionUuid`.
    InvocationId
}

impl InvocationId {
    /// Generate a new random `InvocationId`.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The input string is empty.
    #[error("identifier must not be empty")]
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_id_rejected() {
        assert_eq!(DeviceId::new(""), Err(IdError::Empty));
        assert_eq!(JobId::new("   "), Err(IdError::Empty));
    }

    #[test]
    fn display_is_raw_value() {
        let id = AssignmentId::new("a-1").unwrap();
        assert_eq!(id.to_string(), "a-1");
        assert_eq!(format!("{id:?}"), "AssignmentId(a-1)");
    }

    #[test]
    fn generated_invocations_are_unique() {
        let a = InvocationId::generate();
        let b = InvocationId::generate();
        assert_ne!(a, b);
        assert!(uuid::Uuid::parse_str(a.as_str()).is_ok());
    }

    #[test]
    fn serde_as_plain_string() {
        let id = JobId::new("J1").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"J1\"");
        let parsed: JobId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn serde_rejects_empty() {
        let result: Result<DeviceId, _> = serde_json::from_str("\"\"");
        assert!(result.is_err());
    }
}
