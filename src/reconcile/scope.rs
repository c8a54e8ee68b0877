//! Scope Registry: live AuthScopes keyed by `namespace/credential`.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::toolscope::ToolScope;
use crate::types::ScopeKey;

/// Authorization boundary derived from one credential record.
#[derive(Debug)]
pub struct AuthScope {
    pub key: ScopeKey,
    pub namespace: String,
    pub name: String,
    pub token: String,
    pub tools: Arc<ToolScope>,
}

impl AuthScope {
    /// `/{namespace}/{name}[/{token}]`
    pub fn base_path(&self) -> String {
        if self.token.is_empty() {
            format!("/{}/{}", self.namespace, self.name)
        } else {
            format!("/{}/{}/{}", self.namespace, self.name, self.token)
        }
    }

    pub fn function_path(&self, function: &str) -> String {
        format!("{}/{}", self.base_path(), function)
    }
}

/// Outcome of registering a credential.
#[derive(Debug)]
pub enum ScopeChange {
    /// Same token as the live scope.
    Unchanged,
    /// First sighting; the scope needs backfill.
    Created(Arc<AuthScope>),
    /// Token changed; tool state and groups carried over.
    Rotated(Arc<AuthScope>),
}

#[derive(Debug)]
pub struct ScopeRegistry {
    scopes: DashMap<ScopeKey, Arc<AuthScope>>,
    cancel: CancellationToken,
}

impl ScopeRegistry {
    /// Registry whose groups and sessions are children of `parent`.
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            scopes: DashMap::new(),
            cancel: parent.child_token(),
        }
    }

    pub fn upsert(&self, namespace: &str, name: &str, token: &str) -> ScopeChange {
        let key = ScopeKey::new(namespace, name);
        match self.scopes.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if current.token == token {
                    return ScopeChange::Unchanged;
                }
                let rotated = Arc::new(AuthScope {
                    key,
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    token: token.to_string(),
                    tools: current.tools.clone(),
                });
                occupied.insert(rotated.clone());
                ScopeChange::Rotated(rotated)
            }
            Entry::Vacant(vacant) => {
                let scope = Arc::new(AuthScope {
                    tools: Arc::new(ToolScope::new(key.clone(), namespace, &self.cancel)),
                    key,
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    token: token.to_string(),
                });
                vacant.insert(scope.clone());
                ScopeChange::Created(scope)
            }
        }
    }

    pub fn get(&self, key: &ScopeKey) -> Option<Arc<AuthScope>> {
        self.scopes.get(key).map(|e| e.value().clone())
    }

    pub fn remove(&self, key: &ScopeKey) -> Option<Arc<AuthScope>> {
        self.scopes.remove(key).map(|(_, scope)| scope)
    }

    /// Remove `key` only while it still maps to `scope`.
    pub fn remove_if_same(&self, key: &ScopeKey, scope: &Arc<AuthScope>) -> bool {
        self.scopes
            .remove_if(key, |_, current| Arc::ptr_eq(current, scope))
            .is_some()
    }

    /// Every live scope, ordered by key.
    pub fn snapshot(&self) -> Vec<Arc<AuthScope>> {
        let mut scopes: Vec<Arc<AuthScope>> =
            self.scopes.iter().map(|e| e.value().clone()).collect();
        scopes.sort_by(|a, b| a.key.cmp(&b.key));
        scopes
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}
