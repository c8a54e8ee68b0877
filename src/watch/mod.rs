//! Watched resource model: records, events and the cache contract.
//!
//! The reconciler only depends on [`ResourceCache`] for reads and consumes
//! [`WatchEvent`]s. Events are a closed sum type over the watched kinds, so
//! dispatch is a `match`, never a runtime type check.
//!
//! Implementations shipped here:
//!   - [`MemoryCache`]: eventually-consistent local cache that turns changes into events
//!   - [`ManifestSource`]: re-reads a JSON manifest and diffs it into the cache
//!   - [`pump`]: per-kind sequential delivery, concurrent across kinds

mod cache;
mod manifest;
mod pump;

pub use cache::MemoryCache;
pub use manifest::{Manifest, ManifestSource};
pub use pump::{spawn_pump, EventSink};

use crate::types::{ConfigKey, Result, ScopeKey};
use std::collections::BTreeMap;

/// Label selecting credential records that scope tool endpoints.
pub const CREDENTIAL_LABEL: &str = "fngate.io/secret-type";
/// Required value of [`CREDENTIAL_LABEL`].
pub const CREDENTIAL_LABEL_VALUE: &str = "token";
/// Credential data field holding the path token.
pub const TOKEN_FIELD: &str = "token";
/// Declaration type recognised as a tool declaration.
pub const DECLARATION_TYPE: &str = "mcp";

// =============================================================================
// Records
// =============================================================================

/// Secret-like record scoping a set of tools.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CredentialRecord {
    pub namespace: String,
    pub name: String,
    pub resource_version: String,
    pub labels: BTreeMap<String, String>,
    pub data: BTreeMap<String, Vec<u8>>,
    /// Set while the record is being deleted; upserts carrying it are deletes.
    pub deleting: bool,
}

impl CredentialRecord {
    pub fn key(&self) -> ScopeKey {
        ScopeKey::new(&self.namespace, &self.name)
    }

    /// Path token, or empty when the record has no `token` field.
    pub fn token(&self) -> String {
        self.data
            .get(TOKEN_FIELD)
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
            .unwrap_or_default()
    }

    /// Whether the record carries the credential label selector.
    pub fn is_selected(&self) -> bool {
        self.labels
            .get(CREDENTIAL_LABEL)
            .is_some_and(|v| v == CREDENTIAL_LABEL_VALUE)
    }
}

/// Declarative record binding tool definitions to a backend function.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeclarationRecord {
    pub namespace: String,
    pub name: String,
    pub resource_version: String,
    /// Declaration type; only [`DECLARATION_TYPE`] is served.
    pub decl_type: String,
    /// Target backend function name.
    pub func_name: String,
    /// Opaque JSON argument payload.
    pub args: Vec<u8>,
}

impl DeclarationRecord {
    pub fn key(&self) -> ConfigKey {
        ConfigKey::new(&self.namespace, &self.name, &self.func_name)
    }

    pub fn is_tool_declaration(&self) -> bool {
        self.decl_type == DECLARATION_TYPE
    }
}

/// Backend function definition, read for its invocation timeout.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FunctionRecord {
    pub namespace: String,
    pub name: String,
    pub resource_version: String,
    /// Invocation timeout in seconds; zero means unset.
    pub timeout_secs: u64,
}

impl FunctionRecord {
    /// `namespace/name` endpoint used by the RPC substrate.
    pub fn endpoint(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

// =============================================================================
// Events
// =============================================================================

/// A watched resource of one of the event-producing kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Credential(CredentialRecord),
    Declaration(DeclarationRecord),
}

/// Which stream an event belongs to. Delivery is ordered within a kind only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Credential,
    Declaration,
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Credential(_) => ResourceKind::Credential,
            Resource::Declaration(_) => ResourceKind::Declaration,
        }
    }
}

/// Add/update/delete notification. Adds and updates are both upserts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Upserted(Resource),
    Deleted(Resource),
}

impl WatchEvent {
    pub fn kind(&self) -> ResourceKind {
        match self {
            WatchEvent::Upserted(r) | WatchEvent::Deleted(r) => r.kind(),
        }
    }
}

// =============================================================================
// Cache contract
// =============================================================================

/// Locally cached, eventually-consistent reads of watched resources.
#[cfg_attr(test, mockall::automock)]
pub trait ResourceCache: Send + Sync {
    /// All cached declaration records in a namespace.
    fn list_declarations(&self, namespace: &str) -> Result<Vec<DeclarationRecord>>;

    /// One credential record, `None` when absent.
    fn get_credential(&self, namespace: &str, name: &str) -> Result<Option<CredentialRecord>>;

    /// One function record, `None` when absent.
    fn get_function(&self, namespace: &str, name: &str) -> Result<Option<FunctionRecord>>;
}

impl std::fmt::Debug for dyn ResourceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ResourceCache")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_defaults_to_empty() {
        let cred = CredentialRecord {
            namespace: "a".into(),
            name: "sec1".into(),
            ..Default::default()
        };
        assert_eq!(cred.token(), "");
        assert_eq!(cred.key().as_str(), "a/sec1");
    }

    #[test]
    fn test_token_read_from_data() {
        let mut cred = CredentialRecord::default();
        cred.data.insert(TOKEN_FIELD.into(), b"s3cr3t".to_vec());
        assert_eq!(cred.token(), "s3cr3t");
    }

    #[test]
    fn test_selector_requires_label_value() {
        let mut cred = CredentialRecord::default();
        assert!(!cred.is_selected());
        cred.labels.insert(CREDENTIAL_LABEL.into(), "other".into());
        assert!(!cred.is_selected());
        cred.labels
            .insert(CREDENTIAL_LABEL.into(), CREDENTIAL_LABEL_VALUE.into());
        assert!(cred.is_selected());
    }

    #[test]
    fn test_event_kind() {
        let ev = WatchEvent::Deleted(Resource::Declaration(DeclarationRecord::default()));
        assert_eq!(ev.kind(), ResourceKind::Declaration);
    }
}
