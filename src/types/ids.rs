//! Strongly-typed identifiers.
//!
//! Keys are validated at construction time and implement common traits.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to define a strongly-typed ID newtype wrapper.
///
/// Generates: struct, `from_string()`, `as_str()`, Display, Serialize, Deserialize.
/// Optionally generates `new()` (UUID v4) and `Default` if `uuid` flag is passed.
macro_rules! define_id {
    ($name:ident, uuid) => {
        define_id!($name);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().simple().to_string())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn from_string(s: String) -> Result<Self, &'static str> {
                if s.is_empty() {
                    return Err(concat!(stringify!($name), " cannot be empty"));
                }
                Ok(Self(s))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(ScopeKey);
define_id!(ConfigKey);
define_id!(SessionId, uuid);

impl ScopeKey {
    /// Identity of an authorization scope: `{namespace}/{credential name}`.
    pub fn new(namespace: &str, credential_name: &str) -> Self {
        Self(format!("{}/{}", namespace, credential_name))
    }
}

impl ConfigKey {
    /// Identity of a tool-scope config: `{namespace}/{record name}/{function}`.
    pub fn new(namespace: &str, record_name: &str, function: &str) -> Self {
        Self(format!("{}/{}/{}", namespace, record_name, function))
    }
}
