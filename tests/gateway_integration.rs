//! Gateway integration tests: watch events -> routing table -> SSE session -> bridge -> bus.

use fngate::bridge::{Bridge, BusRequest, RpcBus};
use fngate::reconcile::Reconciler;
use fngate::session::{self, GatewayState};
use fngate::types::{BridgeConfig, SessionConfig};
use fngate::watch::{
    CredentialRecord, DeclarationRecord, FunctionRecord, MemoryCache, CREDENTIAL_LABEL,
    CREDENTIAL_LABEL_VALUE,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct TestGateway {
    base: String,
    cache: Arc<MemoryCache>,
    reconciler: Arc<Reconciler>,
    shutdown: CancellationToken,
    client: reqwest::Client,
}

impl TestGateway {
    /// Spin up a gateway on a random port with an echo function `a/f1`.
    async fn start() -> Self {
        let shutdown = CancellationToken::new();
        let cache = Arc::new(MemoryCache::new(""));
        cache.upsert_function(FunctionRecord {
            namespace: "a".into(),
            name: "f1".into(),
            timeout_secs: 5,
            ..Default::default()
        });
        let reconciler = Arc::new(Reconciler::new(cache.clone(), &shutdown));

        let bus = RpcBus::new();
        bus.serve("a/f1", |req: BusRequest| async move { Ok(req.payload) })
            .await
            .unwrap();
        let bridge = Arc::new(Bridge::new(
            Arc::new(bus),
            cache.clone(),
            BridgeConfig::default(),
        ));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = GatewayState {
            routes: reconciler.routes(),
            bridge,
            session: SessionConfig::default(),
        };
        tokio::spawn(session::serve(listener, state, shutdown.clone()));

        Self {
            base: format!("http://{}", addr),
            cache,
            reconciler,
            shutdown,
            client: reqwest::Client::new(),
        }
    }

    fn put_credential(&self, name: &str) {
        let mut rec = CredentialRecord {
            namespace: "a".into(),
            name: name.into(),
            ..Default::default()
        };
        rec.labels
            .insert(CREDENTIAL_LABEL.into(), CREDENTIAL_LABEL_VALUE.into());
        if let Some(ev) = self.cache.upsert_credential(rec) {
            self.reconciler.handle(ev);
        }
    }

    fn put_declaration(&self, name: &str, function: &str, tools: &str) {
        let rec = DeclarationRecord {
            namespace: "a".into(),
            name: name.into(),
            decl_type: "mcp".into(),
            func_name: function.into(),
            args: format!(r#"{{"token":"sec1","tools":{}}}"#, tools).into_bytes(),
            ..Default::default()
        };
        if let Some(ev) = self.cache.upsert_declaration(rec) {
            self.reconciler.handle(ev);
        }
    }

    fn drop_declaration(&self, name: &str) {
        if let Some(ev) = self.cache.delete_declaration("a", name) {
            self.reconciler.handle(ev);
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Minimal SSE reader over a streaming response.
struct SseReader {
    stream: futures::stream::BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    buffer: String,
}

impl SseReader {
    fn new(response: reqwest::Response) -> Self {
        Self {
            stream: response.bytes_stream().boxed(),
            buffer: String::new(),
        }
    }

    /// Next `(event, data)` pair, or `None` once the stream ends.
    async fn next_event(&mut self) -> Option<(String, String)> {
        loop {
            if let Some(idx) = self.buffer.find("\n\n") {
                let block: String = self.buffer.drain(..idx + 2).collect();
                let mut event = String::from("message");
                let mut data = Vec::new();
                for line in block.lines() {
                    if let Some(v) = line.strip_prefix("event:") {
                        event = v.trim().to_string();
                    } else if let Some(v) = line.strip_prefix("data:") {
                        data.push(v.trim_start().to_string());
                    }
                }
                if data.is_empty() {
                    continue; // keep-alive comment
                }
                return Some((event, data.join("\n")));
            }
            let chunk = tokio::time::timeout(Duration::from_secs(5), self.stream.next())
                .await
                .ok()??
                .ok()?;
            self.buffer.push_str(&String::from_utf8_lossy(&chunk));
        }
    }
}

async fn open_session(gw: &TestGateway, prefix: &str) -> (SseReader, String) {
    let response = gw.client.get(gw.url(&format!("{}/sse", prefix))).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let mut reader = SseReader::new(response);
    let (event, endpoint) = reader.next_event().await.unwrap();
    assert_eq!(event, "endpoint");
    assert!(endpoint.starts_with(&format!("{}/message?sessionId=", prefix)));
    (reader, endpoint)
}

async fn rpc(
    gw: &TestGateway,
    reader: &mut SseReader,
    endpoint: &str,
    body: serde_json::Value,
) -> serde_json::Value {
    let response = gw.client.post(gw.url(endpoint)).json(&body).send().await.unwrap();
    assert_eq!(response.status(), 202);
    let (event, data) = reader.next_event().await.unwrap();
    assert_eq!(event, "message");
    serde_json::from_str(&data).unwrap()
}

#[tokio::test]
async fn test_tool_round_trip() {
    let gw = TestGateway::start().await;
    gw.put_credential("sec1");
    gw.put_declaration("t1", "f1", r#"[{"name":"echo","desc":"Echo"}]"#);

    let (mut reader, endpoint) = open_session(&gw, "/a/sec1/f1").await;

    let init = rpc(
        &gw,
        &mut reader,
        &endpoint,
        serde_json::json!({"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}),
    )
    .await;
    assert_eq!(init["result"]["protocolVersion"], "2024-11-05");

    let list = rpc(
        &gw,
        &mut reader,
        &endpoint,
        serde_json::json!({"jsonrpc":"2.0","id":2,"method":"tools/list"}),
    )
    .await;
    assert_eq!(list["result"]["tools"][0]["name"], "echo");

    let call = rpc(
        &gw,
        &mut reader,
        &endpoint,
        serde_json::json!({
            "jsonrpc":"2.0","id":3,"method":"tools/call",
            "params":{"name":"echo","arguments":{"text":"hello"}}
        }),
    )
    .await;
    assert_eq!(call["id"], 3);
    assert_eq!(call["result"]["isError"], false);
    let text = call["result"]["content"][0]["text"].as_str().unwrap();
    let echoed: serde_json::Value = serde_json::from_str(text).unwrap();
    assert_eq!(echoed["text"], "hello");
    assert_eq!(echoed["_call_type"], "tool");
}

#[tokio::test]
async fn test_scope_index_lists_functions() {
    let gw = TestGateway::start().await;
    gw.put_credential("sec1");
    gw.put_declaration("t1", "f1", r#"[{"name":"echo"}]"#);

    let index: serde_json::Value = gw
        .client
        .get(gw.url("/a/sec1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(index["scope"], "a/sec1");
    assert_eq!(index["functions"][0]["path"], "/a/sec1/f1");
}

#[tokio::test]
async fn test_unknown_path_is_404() {
    let gw = TestGateway::start().await;
    let response = gw.client.get(gw.url("/a/sec1/f1/sse")).send().await.unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_declaration_delete_closes_session_and_route() {
    let gw = TestGateway::start().await;
    gw.put_credential("sec1");
    gw.put_declaration("t1", "f1", r#"[{"name":"echo"}]"#);

    let (mut reader, endpoint) = open_session(&gw, "/a/sec1/f1").await;
    gw.drop_declaration("t1");

    // Stream ends once the group is closed.
    assert!(reader.next_event().await.is_none());

    let response = gw
        .client
        .post(gw.url(&endpoint))
        .json(&serde_json::json!({"jsonrpc":"2.0","id":1,"method":"ping"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_unknown_session_is_404() {
    let gw = TestGateway::start().await;
    gw.put_credential("sec1");
    gw.put_declaration("t1", "f1", r#"[{"name":"echo"}]"#);

    let response = gw
        .client
        .post(gw.url("/a/sec1/f1/message?sessionId=nope"))
        .json(&serde_json::json!({"jsonrpc":"2.0","id":1,"method":"ping"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_health_reports_generation() {
    let gw = TestGateway::start().await;
    gw.put_credential("sec1");
    gw.put_declaration("t1", "f1", r#"[{"name":"echo"}]"#);

    let health: serde_json::Value = gw
        .client
        .get(gw.url("/healthz"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["routes"], 1);
}

#[tokio::test]
async fn test_tools_list_sends_schema_as_declared() {
    let gw = TestGateway::start().await;
    gw.put_credential("sec1");
    let schema = r#"{"type":"object","properties":{"z":{"maximum":99999999999999999999},"a":{}}}"#;
    gw.put_declaration("t1", "f1", &format!(r#"[{{"name":"big","schema":{}}}]"#, schema));

    let (mut reader, endpoint) = open_session(&gw, "/a/sec1/f1").await;
    let response = gw
        .client
        .post(gw.url(&endpoint))
        .json(&serde_json::json!({"jsonrpc":"2.0","id":1,"method":"tools/list"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    let (_, data) = reader.next_event().await.unwrap();
    assert!(data.contains(&format!(r#""inputSchema":{}"#, schema)));
}
