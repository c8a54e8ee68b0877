//! FunctionGroup: the live, session-serving unit for one backend function
//! under one AuthScope.
//!
//! A group outlives reconfiguration. Its tool list is swapped in place so
//! open sessions immediately see the new tools; the group is only closed
//! when no configuration references its function anymore.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::decl::ToolDef;
use crate::types::{ScopeKey, SessionId};

/// Registry entry of one open session.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    /// Outbound JSON-RPC messages for the session stream, already encoded.
    pub tx: mpsc::Sender<String>,
    pub cancel: CancellationToken,
}

/// An opened session handed to the stream writer.
#[derive(Debug)]
pub struct OpenedSession {
    pub id: SessionId,
    pub rx: mpsc::Receiver<String>,
    pub cancel: CancellationToken,
}

#[derive(Debug)]
pub struct FunctionGroup {
    scope: ScopeKey,
    namespace: String,
    function: String,
    tools: RwLock<Arc<Vec<ToolDef>>>,
    sessions: DashMap<SessionId, SessionEntry>,
    cancel: CancellationToken,
}

impl FunctionGroup {
    /// New group whose sessions are children of `parent`.
    pub fn new(
        scope: ScopeKey,
        namespace: &str,
        function: &str,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            scope,
            namespace: namespace.to_string(),
            function: function.to_string(),
            tools: RwLock::new(Arc::new(Vec::new())),
            sessions: DashMap::new(),
            cancel: parent.child_token(),
        }
    }

    pub fn scope(&self) -> &ScopeKey {
        &self.scope
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    /// Current tool list snapshot.
    pub fn tools(&self) -> Arc<Vec<ToolDef>> {
        self.tools.read().clone()
    }

    pub fn tool(&self, name: &str) -> Option<ToolDef> {
        self.tools.read().iter().find(|t| t.name == name).cloned()
    }

    /// Replace the tool list in place.
    pub fn set_tools(&self, tools: Vec<ToolDef>) {
        *self.tools.write() = Arc::new(tools);
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Register a new session. On a closed group the session starts canceled.
    pub fn open_session(&self, capacity: usize) -> OpenedSession {
        let id = SessionId::new();
        let (tx, rx) = mpsc::channel(capacity);
        let cancel = self.cancel.child_token();
        self.sessions.insert(
            id.clone(),
            SessionEntry {
                tx,
                cancel: cancel.clone(),
            },
        );
        OpenedSession { id, rx, cancel }
    }

    pub fn session(&self, id: &SessionId) -> Option<SessionEntry> {
        self.sessions.get(id).map(|e| e.value().clone())
    }

    /// Drop one session from the registry, canceling it.
    pub fn close_session(&self, id: &SessionId) {
        if let Some((_, entry)) = self.sessions.remove(id) {
            entry.cancel.cancel();
        }
    }

    /// Cancel every open session while keeping the group live.
    pub fn close_sessions(&self) -> usize {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in &ids {
            self.close_session(id);
        }
        ids.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Cancel every session and refuse new ones.
    pub fn close(&self) {
        let closed = self.close_sessions();
        self.cancel.cancel();
        tracing::debug!(
            "closed group {}/{} ({} sessions)",
            self.scope,
            self.function,
            closed
        );
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
