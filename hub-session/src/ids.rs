//! Opaque identifiers for agents, sessions, tasks and lock tokens.
//!
//! Each type wraps a UUID: newtype, `Display`, round-trippable through
//! `Serialize`/`Deserialize`, and a `FromStr` impl for values coming back off
//! the wire or out of a persisted snapshot.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! opaque_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Wrap an externally supplied string (auth tokens, task IDs chosen
            /// by the client) without requiring it to be a UUID.
            pub fn from_raw(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// Borrow the underlying string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_string()))
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

opaque_id!(AgentId, "Stable, process-lifetime-spanning identity for an agent.");
opaque_id!(SessionId, "Identifier for one connected instance of an agent.");
opaque_id!(TaskId, "Identifier for a unit of shared work, chosen by the client.");
opaque_id!(LockToken, "High-entropy capability proving current lease ownership.");

/// Generate a high-entropy secret suitable for an auth token or lock token.
///
/// Plain UUIDs (122 bits of randomness from a CSPRNG) are already
/// unguessable; reusing `Uuid::new_v4` keeps this crate free of an extra
/// RNG dependency while matching what `AgentId`/`SessionId` already do.
pub fn generate_secret() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(AgentId::new(), AgentId::new());
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn round_trips_through_json() {
        let id = TaskId::from("T-42");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"T-42\"");
        let back: TaskId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn display_matches_as_str() {
        let id = AgentId::new();
        assert_eq!(id.to_string(), id.as_str());
    }
}
