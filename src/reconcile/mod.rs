//! Reconciliation engine.
//!
//! Turns credential and declaration events into AuthScopes, FunctionGroups
//! and a freshly built routing table. Every event is handled to completion
//! on its delivery lane; errors are logged and contained to that event.
//!
//! Dispatch is a closed match over [`WatchEvent`]:
//!   - credential upsert: register or rotate the scope, backfill new scopes
//!   - credential delete: drop the scope, close its groups
//!   - declaration upsert: decode and store the config under its owning scope
//!   - declaration delete: remove the config from its owning scope

pub mod decl;
pub mod group;
pub mod routing;
pub mod scope;
pub mod toolscope;

pub use decl::{decode_declaration, ToolDef, ToolScopeConfig};
pub use group::{FunctionGroup, OpenedSession, SessionEntry};
pub use routing::{RouteMatch, RouteTable, RouteTarget, RoutingTable};
pub use scope::{AuthScope, ScopeChange, ScopeRegistry};
pub use toolscope::ToolScope;

use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::types::{ConfigKey, Error, Result, ScopeKey};
use crate::watch::{CredentialRecord, DeclarationRecord, Resource, ResourceCache, WatchEvent};

#[derive(Debug)]
pub struct Reconciler {
    cache: Arc<dyn ResourceCache>,
    scopes: ScopeRegistry,
    /// Which scope currently holds each config.
    owners: DashMap<ConfigKey, ScopeKey>,
    routes: Arc<RouteTable>,
}

impl Reconciler {
    /// New reconciler. Canceling `shutdown` cancels every group and session.
    pub fn new(cache: Arc<dyn ResourceCache>, shutdown: &CancellationToken) -> Self {
        Self {
            cache,
            scopes: ScopeRegistry::new(shutdown),
            owners: DashMap::new(),
            routes: Arc::new(RouteTable::new()),
        }
    }

    pub fn routes(&self) -> Arc<RouteTable> {
        self.routes.clone()
    }

    pub fn scopes(&self) -> &ScopeRegistry {
        &self.scopes
    }

    pub fn handle(&self, event: WatchEvent) {
        match event {
            WatchEvent::Upserted(Resource::Credential(record)) => {
                if record.deleting || !record.is_selected() {
                    self.delete_credential(&record);
                } else {
                    self.upsert_credential(&record);
                }
            }
            WatchEvent::Deleted(Resource::Credential(record)) => self.delete_credential(&record),
            // A record whose type moved away from tools drops what it placed.
            WatchEvent::Upserted(Resource::Declaration(record)) => {
                if record.is_tool_declaration() {
                    self.upsert_declaration(&record);
                } else {
                    self.delete_declaration(&record);
                }
            }
            WatchEvent::Deleted(Resource::Declaration(record)) => self.delete_declaration(&record),
        }
    }

    fn rebuild(&self) {
        self.routes.rebuild(&self.scopes);
    }

    // =========================================================================
    // Credentials
    // =========================================================================

    fn upsert_credential(&self, record: &CredentialRecord) {
        let key = record.key();
        match self.cache.get_credential(&record.namespace, &record.name) {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::error!("get {} credential error: not found", key);
                return;
            }
            Err(e) => {
                tracing::error!("get {} credential error: {}", key, e);
                return;
            }
        }

        match self
            .scopes
            .upsert(&record.namespace, &record.name, &record.token())
        {
            ScopeChange::Unchanged => {}
            ScopeChange::Rotated(scope) => {
                let closed = scope.tools.close_sessions();
                tracing::info!("rotate {} token, closed {} sessions", key, closed);
                self.rebuild();
            }
            ScopeChange::Created(scope) => {
                if let Err(e) = self.backfill(&scope) {
                    tracing::error!("rebuild tool scope for {} error: {}", key, e);
                    if self.scopes.remove_if_same(&key, &scope) {
                        scope.tools.close();
                    }
                    return;
                }
                tracing::info!("rebuild tool scope for {}", key);
                self.rebuild();
            }
        }
    }

    /// Replay cached declarations owned by a newly seen scope.
    fn backfill(&self, scope: &Arc<AuthScope>) -> Result<()> {
        let loaded = scope.tools.backfill(|| {
            let records = self
                .cache
                .list_declarations(&scope.namespace)
                .map_err(|e| Error::rebuild(format!("list {} declarations: {}", scope.namespace, e)))?;
            Ok(records
                .iter()
                .filter(|r| r.is_tool_declaration())
                .filter_map(|r| decode_declaration(r).ok())
                .filter(|c| c.scope_key() == scope.key)
                .collect())
        })?;

        for key in loaded {
            if let Some(previous) = self.owners.insert(key.clone(), scope.key.clone()) {
                if previous != scope.key {
                    self.release(&previous, &key);
                }
            }
        }
        Ok(())
    }

    fn delete_credential(&self, record: &CredentialRecord) {
        let key = record.key();
        let Some(scope) = self.scopes.remove(&key) else {
            return;
        };
        scope.tools.close();
        self.owners.retain(|_, owner| owner != &key);
        tracing::info!("delete tool scope {}", key);
        self.rebuild();
    }

    // =========================================================================
    // Declarations
    // =========================================================================

    fn upsert_declaration(&self, record: &DeclarationRecord) {
        let config = match decode_declaration(record) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("skip declaration: {}", e);
                return;
            }
        };
        let key = config.key.clone();
        let target = config.scope_key();

        // Drop stale placements: another scope, or an earlier function name.
        let mut changed = false;
        let prefix = format!("{}/{}/", record.namespace, record.name);
        let stale: Vec<(ConfigKey, ScopeKey)> = self
            .owners
            .iter()
            .filter(|e| e.key().as_str().starts_with(&prefix))
            .filter(|e| e.key() != &key || e.value() != &target)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (stale_key, owner) in stale {
            self.owners.remove(&stale_key);
            changed |= self.release(&owner, &stale_key);
        }

        match self.scopes.get(&target) {
            Some(scope) => {
                self.owners.insert(key, target);
                changed |= scope.tools.upsert(config);
            }
            None => {
                tracing::error!("tool scope {} not found for {}", target, key);
            }
        }

        if changed {
            self.rebuild();
        }
    }

    fn delete_declaration(&self, record: &DeclarationRecord) {
        let prefix = format!("{}/{}/", record.namespace, record.name);
        let mut placed: Vec<(ConfigKey, ScopeKey)> = self
            .owners
            .iter()
            .filter(|e| e.key().as_str().starts_with(&prefix))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        if placed.is_empty() {
            match decode_declaration(record) {
                Ok(config) => placed.push((config.key.clone(), config.scope_key())),
                Err(_) => return,
            }
        }

        let mut changed = false;
        for (key, owner) in placed {
            self.owners.remove(&key);
            changed |= self.release(&owner, &key);
        }
        if changed {
            self.rebuild();
        }
    }

    /// Remove `key` from `owner`'s config set. Returns whether it was stored.
    fn release(&self, owner: &ScopeKey, key: &ConfigKey) -> bool {
        match self.scopes.get(owner) {
            Some(scope) => scope.tools.remove(key),
            None => false,
        }
    }
}
