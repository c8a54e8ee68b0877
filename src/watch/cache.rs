//! In-memory watch cache.
//!
//! Stores the latest version of every watched record and converts each change
//! into the [`WatchEvent`] a watcher would deliver. Unchanged versions produce
//! no event.

use dashmap::DashMap;

use super::{
    CredentialRecord, DeclarationRecord, FunctionRecord, Resource, ResourceCache, WatchEvent,
};
use crate::types::Result;

/// Local cache of credential, declaration and function records.
#[derive(Debug, Default)]
pub struct MemoryCache {
    /// Namespace scope; empty accepts every namespace.
    namespace: String,
    credentials: DashMap<String, CredentialRecord>,
    declarations: DashMap<String, DeclarationRecord>,
    functions: DashMap<String, FunctionRecord>,
}

fn object_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// Same record version: equal non-empty resource versions, or identical content.
fn unchanged<T: PartialEq>(old: &T, new: &T, old_rv: &str, new_rv: &str) -> bool {
    if !old_rv.is_empty() && old_rv == new_rv {
        return true;
    }
    old == new
}

impl MemoryCache {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    fn accepts(&self, namespace: &str) -> bool {
        self.namespace.is_empty() || self.namespace == namespace
    }

    // =========================================================================
    // Credentials
    // =========================================================================

    /// Store a credential record. Records outside the label selector behave
    /// as absent: a previously selected record that loses its label is deleted.
    /// A record marked `deleting` is deleted as well.
    pub fn upsert_credential(&self, record: CredentialRecord) -> Option<WatchEvent> {
        if !self.accepts(&record.namespace) {
            return None;
        }
        let key = object_key(&record.namespace, &record.name);
        if !record.is_selected() || record.deleting {
            return self
                .credentials
                .remove(&key)
                .map(|(_, prev)| WatchEvent::Deleted(Resource::Credential(prev)));
        }
        if let Some(prev) = self.credentials.get(&key) {
            if unchanged(&*prev, &record, &prev.resource_version, &record.resource_version) {
                return None;
            }
        }
        self.credentials.insert(key, record.clone());
        Some(WatchEvent::Upserted(Resource::Credential(record)))
    }

    pub fn delete_credential(&self, namespace: &str, name: &str) -> Option<WatchEvent> {
        self.credentials
            .remove(&object_key(namespace, name))
            .map(|(_, prev)| WatchEvent::Deleted(Resource::Credential(prev)))
    }

    // =========================================================================
    // Declarations
    // =========================================================================

    pub fn upsert_declaration(&self, record: DeclarationRecord) -> Option<WatchEvent> {
        if !self.accepts(&record.namespace) {
            return None;
        }
        let key = object_key(&record.namespace, &record.name);
        if let Some(prev) = self.declarations.get(&key) {
            if unchanged(&*prev, &record, &prev.resource_version, &record.resource_version) {
                return None;
            }
        }
        self.declarations.insert(key, record.clone());
        Some(WatchEvent::Upserted(Resource::Declaration(record)))
    }

    pub fn delete_declaration(&self, namespace: &str, name: &str) -> Option<WatchEvent> {
        self.declarations
            .remove(&object_key(namespace, name))
            .map(|(_, prev)| WatchEvent::Deleted(Resource::Declaration(prev)))
    }

    // =========================================================================
    // Functions (read-only for the reconciler, no events)
    // =========================================================================

    pub fn upsert_function(&self, record: FunctionRecord) {
        if self.accepts(&record.namespace) {
            self.functions
                .insert(object_key(&record.namespace, &record.name), record);
        }
    }

    pub fn delete_function(&self, namespace: &str, name: &str) {
        self.functions.remove(&object_key(namespace, name));
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// `(namespace, name)` of every cached credential.
    pub fn credential_names(&self) -> Vec<(String, String)> {
        self.credentials
            .iter()
            .map(|e| (e.namespace.clone(), e.name.clone()))
            .collect()
    }

    /// `(namespace, name)` of every cached declaration.
    pub fn declaration_names(&self) -> Vec<(String, String)> {
        self.declarations
            .iter()
            .map(|e| (e.namespace.clone(), e.name.clone()))
            .collect()
    }

    /// `(namespace, name)` of every cached function.
    pub fn function_names(&self) -> Vec<(String, String)> {
        self.functions
            .iter()
            .map(|e| (e.namespace.clone(), e.name.clone()))
            .collect()
    }
}

impl ResourceCache for MemoryCache {
    fn list_declarations(&self, namespace: &str) -> Result<Vec<DeclarationRecord>> {
        let mut records: Vec<DeclarationRecord> = self
            .declarations
            .iter()
            .filter(|e| e.namespace == namespace)
            .map(|e| e.value().clone())
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    fn get_credential(&self, namespace: &str, name: &str) -> Result<Option<CredentialRecord>> {
        Ok(self
            .credentials
            .get(&object_key(namespace, name))
            .map(|e| e.value().clone()))
    }

    fn get_function(&self, namespace: &str, name: &str) -> Result<Option<FunctionRecord>> {
        Ok(self
            .functions
            .get(&object_key(namespace, name))
            .map(|e| e.value().clone()))
    }
}
