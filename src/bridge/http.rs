//! HTTP function-gateway substrate.
//!
//! Each submission is a `POST {base}/{namespace}/{function}` with the payload
//! as the JSON body. A 2xx response body is the result; any other status is a
//! backend error whose message is the response body.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::Instrument;

use super::{CallHandle, RpcSubstrate, SubmitRequest};
use crate::types::{Error, Result};

/// Header carrying the correlation id.
pub const CORRELATION_HEADER: &str = "x-correlation-id";
/// Header carrying the timeout hint in whole seconds.
pub const TIMEOUT_HEADER: &str = "x-timeout-hint";

#[derive(Debug, Clone)]
pub struct HttpSubstrate {
    client: Client,
    base_url: String,
}

impl HttpSubstrate {
    /// Build a client identifying itself as `fngate/{client_name}`.
    pub fn new(base_url: &str, client_name: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(format!("fngate/{}", client_name))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::backend(format!("http client build error: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url_for(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint)
    }
}

#[async_trait]
impl RpcSubstrate for HttpSubstrate {
    async fn submit(&self, request: SubmitRequest) -> Result<CallHandle> {
        let url = self.url_for(&request.endpoint);
        let builder = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(CORRELATION_HEADER, request.correlation_id.as_str())
            .header(TIMEOUT_HEADER, request.timeout_hint.as_secs().to_string())
            .timeout(request.timeout_hint)
            .body(request.payload);

        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(
            async move {
                let result = match builder.send().await {
                    Ok(response) => {
                        let status = response.status();
                        match response.bytes().await {
                            Ok(body) if status.is_success() => Ok(body),
                            Ok(body) if body.is_empty() => Err(format!("backend status {}", status)),
                            Ok(body) => Err(String::from_utf8_lossy(&body).into_owned()),
                            Err(e) => Err(format!("read response error: {}", e)),
                        }
                    }
                    Err(e) => Err(format!("call func error: {}", e)),
                };
                tracing::debug!("http call to {} finished", url);
                let _ = tx.send(result);
            }
            .instrument(request.span),
        );

        Ok(CallHandle::new(rx).with_task(task.abort_handle()))
    }
}
