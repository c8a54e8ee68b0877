//! Routing Table: immutable path snapshot plus its atomic holder.
//!
//! A table is built from the full scope set, never patched. Readers load the
//! current `Arc` once and resolve against it; builders are serialized so a
//! table older than the installed one can never replace it.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::group::FunctionGroup;
use super::scope::{AuthScope, ScopeRegistry};

/// What a path prefix resolves to.
#[derive(Debug, Clone)]
pub enum RouteTarget {
    /// Session front of one FunctionGroup.
    Function {
        scope: Arc<AuthScope>,
        group: Arc<FunctionGroup>,
    },
    /// Base path of a scope, answering with the function paths under it.
    ScopeIndex {
        scope: Arc<AuthScope>,
        functions: Vec<String>,
    },
}

/// A resolved lookup.
#[derive(Debug, Clone, Copy)]
pub struct RouteMatch<'a> {
    pub prefix: &'a str,
    /// Remainder after the prefix, empty or starting with `/`.
    pub rest: &'a str,
    pub target: &'a RouteTarget,
}

#[derive(Debug)]
pub struct RoutingTable {
    routes: BTreeMap<String, RouteTarget>,
    generation: u64,
    built_at: DateTime<Utc>,
}

impl RoutingTable {
    pub fn empty() -> Self {
        Self {
            routes: BTreeMap::new(),
            generation: 0,
            built_at: Utc::now(),
        }
    }

    /// One function route per live group, one index route per scope.
    pub fn build(scopes: &[Arc<AuthScope>], generation: u64) -> Self {
        let mut routes = BTreeMap::new();
        for scope in scopes {
            let groups = scope.tools.groups();
            let mut functions = Vec::with_capacity(groups.len());
            for group in groups {
                let path = scope.function_path(group.function());
                functions.push(group.function().to_string());
                if routes.contains_key(&path) {
                    tracing::warn!("{} function {} path collides, skipped", scope.key, group.function());
                    continue;
                }
                routes.insert(
                    path,
                    RouteTarget::Function {
                        scope: scope.clone(),
                        group,
                    },
                );
            }
            let base = scope.base_path();
            if routes.contains_key(&base) {
                tracing::warn!("{} base path collides, skipped", scope.key);
                continue;
            }
            routes.insert(
                base,
                RouteTarget::ScopeIndex {
                    scope: scope.clone(),
                    functions,
                },
            );
        }
        Self {
            routes,
            generation,
            built_at: Utc::now(),
        }
    }

    /// Longest registered prefix of `path` on a segment boundary. Scope index
    /// routes only match their exact base path.
    pub fn lookup<'a>(&'a self, path: &'a str) -> Option<RouteMatch<'a>> {
        let path = match path.trim_end_matches('/') {
            "" => "/",
            trimmed => trimmed,
        };
        let mut candidate = path;
        loop {
            if let Some((prefix, target)) = self.routes.get_key_value(candidate) {
                let exact = candidate.len() == path.len();
                if exact || matches!(target, RouteTarget::Function { .. }) {
                    return Some(RouteMatch {
                        prefix: prefix.as_str(),
                        rest: &path[candidate.len()..],
                        target,
                    });
                }
            }
            match candidate.rfind('/') {
                Some(0) | None => return None,
                Some(idx) => candidate = &candidate[..idx],
            }
        }
    }

    pub fn paths(&self) -> Vec<&str> {
        self.routes.keys().map(String::as_str).collect()
    }

    /// Paths served by FunctionGroups.
    pub fn function_paths(&self) -> Vec<&str> {
        self.routes
            .iter()
            .filter(|(_, t)| matches!(t, RouteTarget::Function { .. }))
            .map(|(p, _)| p.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }
}

/// Holder of the current [`RoutingTable`].
#[derive(Debug)]
pub struct RouteTable {
    current: RwLock<Arc<RoutingTable>>,
    build_lock: Mutex<()>,
    generation: AtomicU64,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(RoutingTable::empty())),
            build_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Current snapshot. Callers resolve one request against one snapshot.
    pub fn load(&self) -> Arc<RoutingTable> {
        self.current.read().clone()
    }

    /// Rebuild from the registry and install the result.
    pub fn rebuild(&self, registry: &ScopeRegistry) -> Arc<RoutingTable> {
        let _guard = self.build_lock.lock();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let table = Arc::new(RoutingTable::build(&registry.snapshot(), generation));
        *self.current.write() = table.clone();
        tracing::info!(
            "install routing table generation={} routes={}",
            generation,
            table.len()
        );
        table
    }

    /// Number of tables installed so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}
