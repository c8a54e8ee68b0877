//! HTTP gateway.
//!
//! Every request resolves against exactly one routing snapshot, loaded once
//! at the start of the request. The router itself never changes; routing
//! happens in the fallback handler against the current table.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use super::front;
use crate::bridge::Bridge;
use crate::reconcile::{RouteTable, RouteTarget};
use crate::types::{Result, SessionConfig};

/// Shared state of the gateway router.
#[derive(Debug, Clone)]
pub struct GatewayState {
    pub routes: Arc<RouteTable>,
    pub bridge: Arc<Bridge>,
    pub session: SessionConfig,
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .fallback(dispatch)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let table = state.routes.load();
    Json(json!({
        "status": "ok",
        "generation": table.generation(),
        "routes": table.function_paths().len(),
    }))
}

async fn dispatch(
    State(state): State<GatewayState>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let table = state.routes.load();
    let Some(hit) = table.lookup(uri.path()) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match hit.target {
        RouteTarget::ScopeIndex { scope, functions } => {
            if method != Method::GET {
                return StatusCode::METHOD_NOT_ALLOWED.into_response();
            }
            let functions: Vec<_> = functions
                .iter()
                .map(|f| json!({"name": f, "path": scope.function_path(f)}))
                .collect();
            Json(json!({
                "scope": scope.key,
                "functions": functions,
                "generation": table.generation(),
                "built_at": table.built_at(),
            }))
            .into_response()
        }
        RouteTarget::Function { group, .. } => match (&method, hit.rest) {
            (&Method::GET, "/sse") => front::open_stream(
                group.clone(),
                hit.prefix,
                state.session.channel_capacity,
                state.session.keep_alive,
            ),
            (&Method::POST, "/message") => {
                let session_id = Query::<MessageQuery>::try_from_uri(&uri)
                    .ok()
                    .and_then(|Query(q)| q.session_id);
                front::accept_message(
                    group.clone(),
                    state.bridge.clone(),
                    session_id.as_deref(),
                    &body,
                )
            }
            _ => StatusCode::NOT_FOUND.into_response(),
        },
    }
}

/// Serve the gateway on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    state: GatewayState,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!("Listen and serving on {}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    tracing::info!("gateway stopped");
    Ok(())
}
