//! Session front of one FunctionGroup: MCP over SSE.
//!
//! `GET {prefix}/sse` opens a session stream whose first event names the
//! message endpoint. `POST {prefix}/message?sessionId=..` accepts one
//! JSON-RPC message and answers on the stream.

use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use futures::StreamExt;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::protocol::{
    call_tool_result, initialize_result, tools_list_result, CallToolParams, JsonRpcRequest,
    JsonRpcResponse, RPC_INVALID_REQUEST, RPC_METHOD_NOT_FOUND, RPC_PARSE_ERROR,
};
use crate::bridge::{Bridge, CallKind, Invocation};
use crate::reconcile::FunctionGroup;
use crate::types::{SessionId, RPC_INVALID_PARAMS, RPC_NOT_FOUND};

/// Unregisters a session once its stream is dropped.
struct SessionGuard {
    group: Arc<FunctionGroup>,
    id: SessionId,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.group.close_session(&self.id);
        tracing::debug!("session {} closed", self.id);
    }
}

/// Open a session stream on `group`, announced under `prefix`.
pub fn open_stream(
    group: Arc<FunctionGroup>,
    prefix: &str,
    capacity: usize,
    keep_alive: Duration,
) -> Response {
    let opened = group.open_session(capacity);
    let endpoint = format!("{}/message?sessionId={}", prefix, opened.id);
    tracing::debug!("session {} opened on {}/{}", opened.id, group.scope(), group.function());

    let guard = SessionGuard {
        group,
        id: opened.id,
    };
    let cancel = opened.cancel;

    let first = futures::stream::once(async move { Event::default().event("endpoint").data(endpoint) });
    let messages = ReceiverStream::new(opened.rx).map(move |message: String| {
        let _session = &guard;
        Event::default().event("message").data(message)
    });
    let stream = first
        .chain(messages)
        .take_until(async move { cancel.cancelled().await })
        .map(Ok::<_, Infallible>);

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(keep_alive))
        .into_response()
}

/// Accept one JSON-RPC message for an open session.
pub fn accept_message(
    group: Arc<FunctionGroup>,
    bridge: Arc<Bridge>,
    session_id: Option<&str>,
    body: &[u8],
) -> Response {
    let Some(session_id) = session_id else {
        return (StatusCode::BAD_REQUEST, "missing sessionId").into_response();
    };
    let id = match SessionId::from_string(session_id.to_string()) {
        Ok(id) => id,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };
    let Some(session) = group.session(&id) else {
        return (StatusCode::NOT_FOUND, "session not found").into_response();
    };

    let request: JsonRpcRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => {
            let reply = JsonRpcResponse::failure(Value::Null, RPC_PARSE_ERROR, e.to_string());
            return (StatusCode::BAD_REQUEST, axum::Json(reply)).into_response();
        }
    };

    tokio::spawn(async move {
        if let Some(reply) = handle_request(&group, &bridge, request, &session.cancel).await {
            if session.tx.send(reply.to_json()).await.is_err() {
                tracing::debug!("session {} gone before reply", id);
            }
        }
    });

    StatusCode::ACCEPTED.into_response()
}

/// Answer one request. Notifications get no reply.
pub async fn handle_request(
    group: &FunctionGroup,
    bridge: &Bridge,
    request: JsonRpcRequest,
    cancel: &CancellationToken,
) -> Option<JsonRpcResponse> {
    let id = request.id.clone()?;
    if request.jsonrpc != super::protocol::JSONRPC_VERSION {
        return Some(JsonRpcResponse::failure(
            id,
            RPC_INVALID_REQUEST,
            "jsonrpc must be \"2.0\"",
        ));
    }

    let reply = match request.method.as_str() {
        "initialize" => JsonRpcResponse::success(
            id,
            &initialize_result(group.function(), group.namespace()),
        ),
        "ping" => JsonRpcResponse::success(id, &serde_json::json!({})),
        "tools/list" => {
            let tools = group.tools();
            JsonRpcResponse::success(id, &tools_list_result(&tools))
        }
        "tools/call" => call_tool(group, bridge, id, request.params, cancel).await,
        other => JsonRpcResponse::failure(
            id,
            RPC_METHOD_NOT_FOUND,
            format!("method not found: {}", other),
        ),
    };
    Some(reply)
}

async fn call_tool(
    group: &FunctionGroup,
    bridge: &Bridge,
    id: Value,
    params: Value,
    cancel: &CancellationToken,
) -> JsonRpcResponse {
    let params: CallToolParams = match serde_json::from_value(params) {
        Ok(params) => params,
        Err(e) => return JsonRpcResponse::failure(id, RPC_INVALID_PARAMS, e.to_string()),
    };
    if group.tool(&params.name).is_none() {
        return JsonRpcResponse::failure(
            id,
            RPC_NOT_FOUND,
            format!("tool not found: {}", params.name),
        );
    }

    let invocation = Invocation {
        namespace: group.namespace().to_string(),
        function: group.function().to_string(),
        kind: CallKind::Tool,
        timeout: params.timeout(),
        method: params.name,
        arguments: params.arguments,
    };
    match bridge.invoke(invocation, cancel).await {
        Ok(outcome) => JsonRpcResponse::success(id, &call_tool_result(&outcome)),
        Err(e) => {
            tracing::warn!("tool call on {}/{} failed: {}", group.scope(), group.function(), e);
            JsonRpcResponse::from_error(id, &e)
        }
    }
}
