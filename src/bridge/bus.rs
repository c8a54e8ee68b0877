//! In-process RPC bus.
//!
//! Functions register a handler channel per endpoint; submissions are routed
//! to that channel together with a oneshot reply sender. Used for local
//! backends and in tests.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::{BackendResult, CallHandle, RpcSubstrate, SubmitRequest};
use crate::types::{Error, Result};

/// Request delivered to an endpoint handler.
#[derive(Debug, Clone)]
pub struct BusRequest {
    pub endpoint: String,
    pub correlation_id: String,
    pub payload: Bytes,
    pub timeout_hint: Duration,
}

/// Reply channel paired with each [`BusRequest`].
pub type BusReply = oneshot::Sender<BackendResult>;

type HandlerTx = mpsc::UnboundedSender<(BusRequest, BusReply)>;

/// In-memory RPC bus.
#[derive(Debug, Clone, Default)]
pub struct RpcBus {
    /// Endpoint handlers: endpoint -> handler channel
    handlers: Arc<RwLock<HashMap<String, HandlerTx>>>,

    /// Statistics
    stats: Arc<RwLock<BusStats>>,
}

/// Statistics about bus usage.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BusStats {
    pub calls_submitted: u64,
    pub registered_handlers: usize,
}

impl RpcBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `endpoint`.
    ///
    /// Returns the receiver of calls. The handler answers each call through
    /// the paired oneshot sender.
    pub async fn register_handler(
        &self,
        endpoint: String,
    ) -> Result<mpsc::UnboundedReceiver<(BusRequest, BusReply)>> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut handlers = self.handlers.write().await;

        if handlers.contains_key(&endpoint) {
            return Err(Error::validation(format!(
                "Handler already registered: {}",
                endpoint
            )));
        }

        handlers.insert(endpoint.clone(), tx);

        let mut stats = self.stats.write().await;
        stats.registered_handlers = handlers.len();

        tracing::debug!("Registered bus handler: {}", endpoint);

        Ok(rx)
    }

    /// Register `handler` for `endpoint` and serve it on a background task,
    /// one spawned task per call.
    pub async fn serve<F, Fut>(&self, endpoint: &str, handler: F) -> Result<JoinHandle<()>>
    where
        F: Fn(BusRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BackendResult> + Send + 'static,
    {
        let mut rx = self.register_handler(endpoint.to_string()).await?;
        let handler = Arc::new(handler);
        Ok(tokio::spawn(async move {
            while let Some((request, reply)) = rx.recv().await {
                let handler = handler.clone();
                tokio::spawn(async move {
                    let result = handler(request).await;
                    let _ = reply.send(result);
                });
            }
        }))
    }

    pub async fn unregister_handler(&self, endpoint: &str) -> Result<()> {
        let mut handlers = self.handlers.write().await;
        handlers.remove(endpoint);

        let mut stats = self.stats.write().await;
        stats.registered_handlers = handlers.len();

        tracing::debug!("Unregistered bus handler: {}", endpoint);

        Ok(())
    }

    pub async fn get_stats(&self) -> BusStats {
        self.stats.read().await.clone()
    }
}

#[async_trait]
impl RpcSubstrate for RpcBus {
    async fn submit(&self, request: SubmitRequest) -> Result<CallHandle> {
        let SubmitRequest {
            endpoint,
            correlation_id,
            payload,
            timeout_hint,
            span,
        } = request;

        async {
            let handlers = self.handlers.read().await;
            let handler = handlers.get(&endpoint).ok_or_else(|| {
                Error::backend(format!("No handler registered for endpoint: {}", endpoint))
            })?;

            let (reply_tx, reply_rx) = oneshot::channel();
            handler
                .send((
                    BusRequest {
                        endpoint: endpoint.clone(),
                        correlation_id,
                        payload,
                        timeout_hint,
                    },
                    reply_tx,
                ))
                .map_err(|_| Error::backend(format!("Handler gone: {}", endpoint)))?;
            drop(handlers);

            let mut stats = self.stats.write().await;
            stats.calls_submitted += 1;

            tracing::debug!("Submitted call to {}", endpoint);
            Ok::<_, Error>(CallHandle::new(reply_rx))
        }
        .instrument(span)
        .await
    }
}
