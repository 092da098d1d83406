//! Identifier types shared across the overseer

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Worker identifier, unique within a session (e.g. `coder-1f3a9c02`)
    AgentId
);
string_id!(
    /// Unit-of-work identifier chosen at decomposition time
    TaskId
);
string_id!(
    /// Orchestration session identifier
    SessionId
);
string_id!(
    /// Message identifier stamped by the bus
    MessageId
);
string_id!(
    /// Approval item identifier (short, human-typeable)
    ItemId
);

fn short_uuid() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

impl AgentId {
    /// Generate a fresh id for a worker of the given role
    pub fn generate(role: &str) -> Self {
        Self(format!("{}-{}", role, short_uuid()))
    }
}

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl ItemId {
    pub fn generate() -> Self {
        Self(short_uuid())
    }
}
