//! Tool-Scope Manager: per-AuthScope config set and FunctionGroup set.
//!
//! Every change recomputes the full function -> tools mapping from the stored
//! configs. Groups are created on first use, updated in place, and closed
//! once their function drops out of the mapping.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::decl::{ToolDef, ToolScopeConfig};
use super::group::FunctionGroup;
use crate::types::{ConfigKey, Result, ScopeKey};

#[derive(Debug, Default)]
struct State {
    configs: BTreeMap<ConfigKey, ToolScopeConfig>,
    groups: BTreeMap<String, Arc<FunctionGroup>>,
}

#[derive(Debug)]
pub struct ToolScope {
    scope: ScopeKey,
    namespace: String,
    state: Mutex<State>,
    cancel: CancellationToken,
}

impl ToolScope {
    pub fn new(scope: ScopeKey, namespace: &str, parent: &CancellationToken) -> Self {
        Self {
            scope,
            namespace: namespace.to_string(),
            state: Mutex::new(State::default()),
            cancel: parent.child_token(),
        }
    }

    /// Store or replace one config. Returns false when the stored config is
    /// already identical, in which case nothing is recomputed.
    pub fn upsert(&self, config: ToolScopeConfig) -> bool {
        let mut state = self.state.lock();
        if state.configs.get(&config.key) == Some(&config) {
            return false;
        }
        tracing::info!("update {} tool config", config.key);
        state.configs.insert(config.key.clone(), config);
        self.recompute(&mut state);
        true
    }

    /// Remove one config. Returns false when it was not stored.
    pub fn remove(&self, key: &ConfigKey) -> bool {
        let mut state = self.state.lock();
        if state.configs.remove(key).is_none() {
            return false;
        }
        tracing::info!("delete {} tool config", key);
        self.recompute(&mut state);
        true
    }

    /// Load configs from `loader` and store them, holding the scope lock for
    /// the whole read so concurrent single-record changes cannot interleave.
    pub fn backfill<F>(&self, loader: F) -> Result<Vec<ConfigKey>>
    where
        F: FnOnce() -> Result<Vec<ToolScopeConfig>>,
    {
        let mut state = self.state.lock();
        let configs = loader()?;
        let keys: Vec<ConfigKey> = configs.iter().map(|c| c.key.clone()).collect();
        for config in configs {
            state.configs.insert(config.key.clone(), config);
        }
        self.recompute(&mut state);
        Ok(keys)
    }

    pub fn config_keys(&self) -> Vec<ConfigKey> {
        self.state.lock().configs.keys().cloned().collect()
    }

    /// Live groups ordered by function name.
    pub fn groups(&self) -> Vec<Arc<FunctionGroup>> {
        self.state.lock().groups.values().cloned().collect()
    }

    pub fn group(&self, function: &str) -> Option<Arc<FunctionGroup>> {
        self.state.lock().groups.get(function).cloned()
    }

    /// Cancel open sessions of every group; groups stay live.
    pub fn close_sessions(&self) -> usize {
        self.groups().iter().map(|g| g.close_sessions()).sum()
    }

    /// Close every group and refuse new sessions.
    pub fn close(&self) {
        let mut state = self.state.lock();
        for group in state.groups.values() {
            group.close();
        }
        state.groups.clear();
        self.cancel.cancel();
    }

    fn recompute(&self, state: &mut State) {
        let merged = merge_tools(state.configs.values());

        for (function, tools) in &merged {
            let group = state
                .groups
                .entry(function.clone())
                .or_insert_with(|| {
                    tracing::info!("create group {}/{}", self.scope, function);
                    Arc::new(FunctionGroup::new(
                        self.scope.clone(),
                        &self.namespace,
                        function,
                        &self.cancel,
                    ))
                });
            group.set_tools(tools.clone());
        }

        let stale: Vec<String> = state
            .groups
            .keys()
            .filter(|f| !merged.contains_key(*f))
            .cloned()
            .collect();
        for function in stale {
            if let Some(group) = state.groups.remove(&function) {
                group.close();
                tracing::info!("delete group {}/{}", self.scope, function);
            }
        }
    }
}

/// Merge configs (visited in key order) into function -> tools.
///
/// Tools with an empty name are skipped. A duplicate name within one function
/// replaces the earlier entry at the earlier position. Functions left with no
/// tools are absent from the result.
pub fn merge_tools<'a>(
    configs: impl Iterator<Item = &'a ToolScopeConfig>,
) -> BTreeMap<String, Vec<ToolDef>> {
    let mut merged: BTreeMap<String, Vec<ToolDef>> = BTreeMap::new();
    for config in configs {
        for (idx, tool) in config.tools.iter().enumerate() {
            if tool.name.is_empty() {
                tracing::warn!("{} index {} tool name is empty", config.key, idx);
                continue;
            }
            let tools = merged.entry(config.function.clone()).or_default();
            match tools.iter_mut().find(|t| t.name == tool.name) {
                Some(existing) => *existing = tool.clone(),
                None => tools.push(tool.clone()),
            }
        }
    }
    merged
}
