//! Domain-specific identifier types.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Create a new identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $label, self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Component identifier, unique within an architecture.
    ComponentId,
    "Component"
);

string_id!(
    /// Edge identifier, unique within an architecture.
    EdgeId,
    "Edge"
);

string_id!(
    /// Region identifier.
    RegionId,
    "Region"
);

impl Default for RegionId {
    fn default() -> Self {
        RegionId::new("default")
    }
}

string_id!(
    /// Fault injection identifier.
    FaultId,
    "Fault"
);

string_id!(
    /// Invariant identifier.
    InvariantId,
    "Invariant"
);

/// Logical request identifier, assigned in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// One visit of a request to one component (a span in the request trace).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

/// Event identifier, assigned in scheduling order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "evt-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_ids_order_lexicographically() {
        let a = ComponentId::new("api");
        let b = ComponentId::new("db");
        assert!(a < b);
        assert_eq!(a.as_str(), "api");
        assert_eq!(a.to_string(), "Component(api)");
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let id = EdgeId::from("api->db");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"api->db\"");
        assert_eq!(serde_json::to_string(&RequestId(7)).unwrap(), "7");
    }
}
