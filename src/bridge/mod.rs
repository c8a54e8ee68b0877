//! Invocation Bridge.
//!
//! Converts one tool call into one backend RPC:
//!   1. tag the arguments with the call kind and method
//!   2. serialize them and derive the correlation id from the bytes
//!   3. resolve the timeout and the endpoint from the function record
//!   4. submit to the [`RpcSubstrate`] and wait for completion, timeout or cancel
//!
//! Backend failures are not errors here: they come back as
//! [`ToolOutcome::Failed`] carrying an error payload. Only timeout,
//! cancellation, lookup and submission problems are [`Error`]s.

mod bus;
mod http;

pub use bus::{BusReply, BusRequest, BusStats, RpcBus};
pub use http::HttpSubstrate;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::types::{BridgeConfig, Error, Result};
use crate::watch::{FunctionRecord, ResourceCache};

/// Argument key carrying the call kind.
pub const CALL_TYPE_KEY: &str = "_call_type";
/// Argument key carrying the called method (the tool name).
pub const CALL_METHOD_KEY: &str = "_call_method";

// =============================================================================
// Substrate contract
// =============================================================================

/// One submission to the backend.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// `namespace/function`
    pub endpoint: String,
    pub correlation_id: String,
    pub payload: Bytes,
    pub timeout_hint: Duration,
    /// Span the substrate logs under.
    pub span: tracing::Span,
}

/// Raw backend result: response bytes, or the backend's error message.
pub type BackendResult = std::result::Result<Bytes, String>;

/// Completion handle of a submitted call.
///
/// Dropping the handle abandons the call; a substrate task attached with
/// [`CallHandle::with_task`] is aborted.
#[derive(Debug)]
pub struct CallHandle {
    rx: oneshot::Receiver<BackendResult>,
    task: Option<AbortHandle>,
}

impl CallHandle {
    pub fn new(rx: oneshot::Receiver<BackendResult>) -> Self {
        Self { rx, task: None }
    }

    pub fn with_task(mut self, task: AbortHandle) -> Self {
        self.task = Some(task);
        self
    }

    /// Wait for completion.
    pub async fn done(&mut self) -> BackendResult {
        match (&mut self.rx).await {
            Ok(result) => result,
            Err(_) => Err("backend dropped the call".to_string()),
        }
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Backend RPC substrate.
#[async_trait]
pub trait RpcSubstrate: Send + Sync + std::fmt::Debug {
    /// Submit one call. Errors mean the call never reached the backend.
    async fn submit(&self, request: SubmitRequest) -> Result<CallHandle>;
}

// =============================================================================
// Pending correlation tracking
// =============================================================================

/// In-flight correlation ids. Identical payloads share an id, so entries
/// are reference counted.
#[derive(Debug, Clone, Default)]
pub struct PendingSet {
    inner: Arc<DashMap<String, usize>>,
}

impl PendingSet {
    fn acquire(&self, id: &str) -> PendingGuard {
        *self.inner.entry(id.to_string()).or_insert(0) += 1;
        PendingGuard {
            set: self.clone(),
            id: id.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.contains_key(id)
    }
}

#[derive(Debug)]
struct PendingGuard {
    set: PendingSet,
    id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.set.inner.remove_if_mut(&self.id, |_, count| {
            *count -= 1;
            *count == 0
        });
    }
}

// =============================================================================
// Bridge
// =============================================================================

/// Kind of call carried in [`CALL_TYPE_KEY`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Tool,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Tool => "tool",
        }
    }
}

/// One call to route to a backend function.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub namespace: String,
    pub function: String,
    pub kind: CallKind,
    pub method: String,
    pub arguments: Map<String, Value>,
    /// Caller-requested timeout; `None` defers to the function record.
    pub timeout: Option<Duration>,
}

/// Result of a completed call, as text for the tool result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    Completed(String),
    /// Backend reported an error; the text is an error payload.
    Failed(String),
}

impl ToolOutcome {
    pub fn text(&self) -> &str {
        match self {
            ToolOutcome::Completed(text) | ToolOutcome::Failed(text) => text,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ToolOutcome::Failed(_))
    }
}

/// Lowercase hex SHA-256 of the payload.
pub fn correlation_id(payload: &[u8]) -> String {
    format!("{:x}", Sha256::digest(payload))
}

/// In-band payload describing a backend failure.
pub fn error_payload(message: &str) -> String {
    serde_json::json!({"type": "error", "payload": {"message": message}}).to_string()
}

#[derive(Debug)]
pub struct Bridge {
    substrate: Arc<dyn RpcSubstrate>,
    cache: Arc<dyn ResourceCache>,
    config: BridgeConfig,
    pending: PendingSet,
}

impl Bridge {
    pub fn new(
        substrate: Arc<dyn RpcSubstrate>,
        cache: Arc<dyn ResourceCache>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            substrate,
            cache,
            config,
            pending: PendingSet::default(),
        }
    }

    /// Calls currently awaiting completion.
    pub fn pending(&self) -> &PendingSet {
        &self.pending
    }

    fn resolve_timeout(&self, requested: Option<Duration>, function: &FunctionRecord) -> Duration {
        let timeout = match requested.filter(|t| !t.is_zero()) {
            Some(t) => t,
            None if function.timeout_secs > 0 => Duration::from_secs(function.timeout_secs),
            None => self.config.default_timeout,
        };
        timeout.min(self.config.max_timeout)
    }

    /// Run one call to completion, timeout, or cancellation of `cancel`.
    pub async fn invoke(&self, call: Invocation, cancel: &CancellationToken) -> Result<ToolOutcome> {
        let mut arguments = call.arguments;
        arguments.insert(CALL_TYPE_KEY.into(), Value::from(call.kind.as_str()));
        arguments.insert(CALL_METHOD_KEY.into(), Value::from(call.method.clone()));
        let payload = Bytes::from(serde_json::to_vec(&Value::Object(arguments))?);
        let correlation_id = correlation_id(&payload);

        let function = self
            .cache
            .get_function(&call.namespace, &call.function)?
            .ok_or_else(|| {
                Error::not_found(format!("function {}/{}", call.namespace, call.function))
            })?;
        let timeout = self.resolve_timeout(call.timeout, &function);
        let endpoint = function.endpoint();

        let span = tracing::debug_span!(
            "invoke",
            endpoint = %endpoint,
            method = %call.method,
            correlation_id = %correlation_id,
        );
        let _pending = self.pending.acquire(&correlation_id);

        let request = SubmitRequest {
            endpoint: endpoint.clone(),
            correlation_id,
            payload,
            timeout_hint: timeout,
            span: span.clone(),
        };
        let call_fut = async {
            let mut handle = self.substrate.submit(request).await?;
            Ok::<_, Error>(handle.done().await)
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::cancelled(format!("call {} canceled", endpoint)));
            }
            _ = tokio::time::sleep(timeout) => {
                tracing::debug!(parent: &span, "call timed out after {:?}", timeout);
                return Err(Error::timeout(format!("call {} timed out after {:?}", endpoint, timeout)));
            }
            result = call_fut.instrument(span.clone()) => result?,
        };

        Ok(match outcome {
            Ok(bytes) => ToolOutcome::Completed(String::from_utf8_lossy(&bytes).into_owned()),
            Err(message) => {
                tracing::debug!(parent: &span, "backend error: {}", message);
                ToolOutcome::Failed(error_payload(&message))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::MemoryCache;
    use pretty_assertions::assert_eq;

    fn cache_with(function: &str, timeout_secs: u64) -> Arc<MemoryCache> {
        let cache = Arc::new(MemoryCache::new(""));
        cache.upsert_function(FunctionRecord {
            namespace: "a".into(),
            name: function.into(),
            timeout_secs,
            ..Default::default()
        });
        cache
    }

    fn call(function: &str, timeout: Option<Duration>) -> Invocation {
        let mut arguments = Map::new();
        arguments.insert("text".into(), Value::from("hi"));
        Invocation {
            namespace: "a".into(),
            function: function.into(),
            kind: CallKind::Tool,
            method: "echo".into(),
            arguments,
            timeout,
        }
    }

    fn bridge(bus: &RpcBus, cache: Arc<MemoryCache>) -> Bridge {
        Bridge::new(Arc::new(bus.clone()), cache, BridgeConfig::default())
    }

    #[test]
    fn test_correlation_id_is_sha256_hex() {
        assert_eq!(
            correlation_id(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_error_payload_shape() {
        let value: Value = serde_json::from_str(&error_payload("boom")).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["payload"]["message"], "boom");
    }

    #[tokio::test]
    async fn test_invoke_tags_arguments() {
        let bus = RpcBus::new();
        let mut rx = bus.register_handler("a/f1".to_string()).await.unwrap();
        tokio::spawn(async move {
            if let Some((request, reply)) = rx.recv().await {
                let _ = reply.send(Ok(request.payload));
            }
        });

        let b = bridge(&bus, cache_with("f1", 0));
        let outcome = b
            .invoke(call("f1", None), &CancellationToken::new())
            .await
            .unwrap();

        let echoed: Value = serde_json::from_str(outcome.text()).unwrap();
        assert_eq!(echoed["text"], "hi");
        assert_eq!(echoed[CALL_TYPE_KEY], "tool");
        assert_eq!(echoed[CALL_METHOD_KEY], "echo");
        assert!(!outcome.is_error());
        assert!(b.pending().is_empty());
    }

    #[tokio::test]
    async fn test_backend_error_is_in_band() {
        let bus = RpcBus::new();
        let mut rx = bus.register_handler("a/f1".to_string()).await.unwrap();
        tokio::spawn(async move {
            if let Some((_request, reply)) = rx.recv().await {
                let _ = reply.send(Err("division by zero".to_string()));
            }
        });

        let b = bridge(&bus, cache_with("f1", 0));
        let outcome = b
            .invoke(call("f1", None), &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.is_error());
        assert!(outcome.text().contains("division by zero"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_hard_failure() {
        let bus = RpcBus::new();
        let _rx = bus.register_handler("a/f1".to_string()).await.unwrap();

        let b = bridge(&bus, cache_with("f1", 2));
        let err = b
            .invoke(call("f1", None), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(b.pending().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_releases_pending() {
        let bus = RpcBus::new();
        let _rx = bus.register_handler("a/f1".to_string()).await.unwrap();
        let b = Arc::new(bridge(&bus, cache_with("f1", 0)));
        let cancel = CancellationToken::new();

        let task = {
            let b = b.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { b.invoke(call("f1", None), &cancel).await })
        };
        while b.pending().is_empty() {
            tokio::task::yield_now().await;
        }
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        assert!(b.pending().is_empty());
    }

    #[tokio::test]
    async fn test_missing_function_fails_before_submit() {
        let bus = RpcBus::new();
        let b = bridge(&bus, Arc::new(MemoryCache::new("")));
        let err = b
            .invoke(call("f1", None), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(bus.get_stats().await.calls_submitted, 0);
    }

    #[tokio::test]
    async fn test_unregistered_endpoint_is_backend_error() {
        let bus = RpcBus::new();
        let b = bridge(&bus, cache_with("f1", 0));
        let err = b
            .invoke(call("f1", None), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
    }

    #[test]
    fn test_timeout_resolution() {
        let bus = RpcBus::new();
        let b = bridge(&bus, Arc::new(MemoryCache::new("")));
        let with_timeout = FunctionRecord {
            timeout_secs: 12,
            ..Default::default()
        };
        let without = FunctionRecord::default();

        assert_eq!(
            b.resolve_timeout(Some(Duration::from_secs(3)), &with_timeout),
            Duration::from_secs(3)
        );
        assert_eq!(b.resolve_timeout(None, &with_timeout), Duration::from_secs(12));
        assert_eq!(b.resolve_timeout(None, &without), Duration::from_secs(30));
        assert_eq!(
            b.resolve_timeout(Some(Duration::from_secs(10_000)), &without),
            Duration::from_secs(600)
        );
    }
}
