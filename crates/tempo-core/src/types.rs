use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// String-backed identifier newtype with the usual conversions.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
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

string_id!(
    /// One run of a job (all of its retry attempts share it). UUIDv7 so ids sort by start.
    ExecutionId
);
string_id!(
    /// Stable identifier of a job definition.
    JobId
);
string_id!(
    /// Agent identifier, chosen by the agent itself at registration.
    AgentId
);
string_id!(
    /// One (execution, agent) binding. Reassignment mints a new one.
    AssignmentId
);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl AssignmentId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

impl Default for AssignmentId {
    fn default() -> Self {
        Self::new()
    }
}
