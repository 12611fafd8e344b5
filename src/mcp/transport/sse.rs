//! Legacy SSE transport.
//!
//! The client opens a persistent GET event stream first. The server pushes an
//! `endpoint` event naming the URL requests must be POSTed to; replies never
//! arrive on the POST response body but as `message` events on the open
//! stream, correlated back to their request by numeric JSON-RPC id through a
//! pending-request map.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{is_event_stream_content_type, response_content_type, SseEventBuffer, MCP_SSE_ACCEPT};
use crate::mcp::protocol::JsonRpcResponse;
use crate::utils::url::resolve_endpoint_url;

pub const ENDPOINT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Correlates in-flight requests with replies arriving on the event stream.
/// Insert happens on the send path, removal on the receive path or on
/// timeout; both removal paths are idempotent since a timeout and a late
/// reply can race.
#[derive(Default)]
pub struct PendingRequests {
    map: Mutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>,
}

impl PendingRequests {
    /// Register a request id. Must be called before the POST is sent so a
    /// fast reply cannot arrive before its correlator exists.
    pub fn register(&self, id: i64) -> oneshot::Receiver<JsonRpcResponse> {
        let (tx, rx) = oneshot::channel();
        self.map.lock().expect("pending map poisoned").insert(id, tx);
        rx
    }

    /// Resolve the pending entry for `id`, if it still exists.
    pub fn resolve(&self, id: i64, response: JsonRpcResponse) -> bool {
        let sender = self.map.lock().expect("pending map poisoned").remove(&id);
        match sender {
            Some(sender) => sender.send(response).is_ok(),
            None => false,
        }
    }

    /// Drop the pending entry for `id`. Safe to call after a resolve.
    pub fn remove(&self, id: i64) -> bool {
        self.map
            .lock()
            .expect("pending map poisoned")
            .remove(&id)
            .is_some()
    }

    /// Abandon every in-flight request. Waiting callers see their channel
    /// close; they are expected to hold their own timeout.
    pub fn clear(&self) {
        self.map.lock().expect("pending map poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.map.lock().expect("pending map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The `endpoint` event payload is a JSON `{uri}` object on conformant
/// servers, but some send a bare string.
pub fn parse_endpoint_payload(data: &str) -> String {
    match serde_json::from_str::<Value>(data) {
        Ok(Value::String(uri)) => uri,
        Ok(Value::Object(map)) => map
            .get("uri")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| data.trim().to_string()),
        _ => data.trim().to_string(),
    }
}

/// An open legacy-SSE connection: the resolved POST endpoint plus the reader
/// task feeding the pending map.
pub struct SseConnection {
    pub post_url: String,
    reader: tokio::task::JoinHandle<()>,
}

impl SseConnection {
    pub async fn open(
        client: &reqwest::Client,
        stream_url: &str,
        auth_token: Option<&str>,
        pending: Arc<PendingRequests>,
    ) -> Result<Self, String> {
        let mut request = client.get(stream_url).header("Accept", MCP_SSE_ACCEPT);
        if let Some(token) = auth_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|err| err.to_string())?;

        if !response.status().is_success() {
            return Err(format!("HTTP error: {}", response.status()));
        }
        if !is_event_stream_content_type(&response_content_type(&response)) {
            return Err("Server did not return an event stream.".to_string());
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();
        let stream_url_owned = stream_url.to_string();
        let reader = tokio::spawn(run_reader(response, pending, endpoint_tx, stream_url_owned));

        let post_url = match tokio::time::timeout(ENDPOINT_WAIT_TIMEOUT, endpoint_rx).await {
            Ok(Ok(url)) => url,
            Ok(Err(_)) => {
                reader.abort();
                return Err("Event stream closed before the endpoint event.".to_string());
            }
            Err(_) => {
                reader.abort();
                return Err("Timed out waiting for the endpoint event.".to_string());
            }
        };

        Ok(Self { post_url, reader })
    }

    /// Stop the reader. Pending requests are cleared by the owning client.
    pub fn close(&self) {
        self.reader.abort();
    }

    /// A connection with a known POST endpoint and no live reader, for tests
    /// that only exercise the send path.
    #[cfg(test)]
    pub fn for_test(post_url: String) -> Self {
        Self {
            post_url,
            reader: tokio::spawn(async {}),
        }
    }
}

impl Drop for SseConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn run_reader(
    response: reqwest::Response,
    pending: Arc<PendingRequests>,
    endpoint_tx: oneshot::Sender<String>,
    stream_url: String,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut stream = response.bytes_stream();
    let mut buffer = SseEventBuffer::default();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!(%err, "MCP event stream failed");
                return;
            }
        };
        for event in buffer.push(&chunk) {
            match event.event.as_str() {
                "endpoint" => {
                    let endpoint = resolve_endpoint_url(
                        &stream_url,
                        &parse_endpoint_payload(&event.data),
                    );
                    debug!(%endpoint, "Received SSE endpoint");
                    if let Some(tx) = endpoint_tx.take() {
                        let _ = tx.send(endpoint);
                    }
                }
                "message" => dispatch_message(&pending, &event.data),
                other => debug!(event = other, "Ignoring SSE event"),
            }
        }
    }

    for event in buffer.finish() {
        if event.event == "message" {
            dispatch_message(&pending, &event.data);
        }
    }
}

fn dispatch_message(pending: &PendingRequests, data: &str) {
    let response = match serde_json::from_str::<JsonRpcResponse>(data) {
        Ok(response) => response,
        Err(err) => {
            debug!(%err, "Skipping undecodable message event");
            return;
        }
    };
    let Some(id) = response.numeric_id() else {
        debug!("Message event without a numeric id");
        return;
    };
    if !pending.resolve(id, response) {
        // Timed out or never registered; late replies are dropped.
        debug!(id, "No pending request for reply");
    }
}
