//! MCP client lifecycle.
//!
//! One client owns one connection to one tool server and walks
//! `Disconnected → Detecting → Connected(transport) → (Calling)* →
//! Disconnected`. Transport is probed when configured as `auto`: a JSON-RPC
//! ping POST selects streamable HTTP; failing that, a GET answering with an
//! event stream selects legacy SSE; failing both, connection fails hard and
//! is not retried.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::api::ChatToolDefinition;
use crate::core::config::McpServerConfig;
use crate::mcp::protocol::{
    initialize_params, normalize_tool_result, parse_initialize, parse_tools_list, JsonRpcRequest,
};
use crate::mcp::transport::sse::{PendingRequests, SseConnection};
use crate::mcp::transport::{
    is_event_stream_content_type, response_content_type, streamable_http, McpTransportChoice,
    McpTransportKind, MCP_SSE_ACCEPT,
};

pub const MCP_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Some servers need initialization to settle asynchronously after the
/// initialized notification before they accept further calls.
pub const INITIALIZED_SETTLE_DELAY: Duration = Duration::from_millis(500);

const MCP_HTTP_CONNECT_TIMEOUT_SECONDS: u64 = 10;
const MCP_HTTP_POOL_IDLE_TIMEOUT_SECONDS: u64 = 90;
const MCP_HTTP_POOL_MAX_IDLE_PER_HOST: usize = 8;

pub fn build_mcp_http_client() -> Result<reqwest::Client, String> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(MCP_HTTP_CONNECT_TIMEOUT_SECONDS))
        .pool_idle_timeout(Duration::from_secs(MCP_HTTP_POOL_IDLE_TIMEOUT_SECONDS))
        .pool_max_idle_per_host(MCP_HTTP_POOL_MAX_IDLE_PER_HOST)
        .build()
        .map_err(|err| err.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Detecting,
    Connected(McpTransportKind),
}

#[derive(Default)]
struct ClientState {
    transport: Option<McpTransportKind>,
    session_id: Option<String>,
    sse: Option<SseConnection>,
    detecting: bool,
}

struct ClientInner {
    http: reqwest::Client,
    server_url: String,
    choice: McpTransportChoice,
    auth_token: Option<String>,
    request_timeout: Duration,
    next_id: AtomicI64,
    pending: Arc<PendingRequests>,
    state: Mutex<ClientState>,
}

/// Handle to one MCP server connection. Cheap to clone; all clones share the
/// same connection and pending-request map.
#[derive(Clone)]
pub struct McpClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("server_url", &self.inner.server_url)
            .field("choice", &self.inner.choice)
            .finish_non_exhaustive()
    }
}

impl McpClient {
    pub fn new(
        server_url: impl Into<String>,
        choice: McpTransportChoice,
        auth_token: Option<String>,
    ) -> Result<Self, String> {
        let server_url = server_url.into();
        if server_url.trim().is_empty() {
            return Err("MCP server URL must not be empty.".to_string());
        }
        Ok(Self {
            inner: Arc::new(ClientInner {
                http: build_mcp_http_client()
                    .map_err(|err| format!("Failed to build HTTP client: {err}"))?,
                server_url,
                choice,
                auth_token,
                request_timeout: MCP_REQUEST_TIMEOUT,
                next_id: AtomicI64::new(0),
                pending: Arc::new(PendingRequests::default()),
                state: Mutex::new(ClientState::default()),
            }),
        })
    }

    pub fn from_config(config: &McpServerConfig) -> Result<Self, String> {
        let choice = McpTransportChoice::parse(config.transport.as_deref())?;
        Self::new(config.base_url.clone(), choice, config.auth_token())
    }

    pub fn server_url(&self) -> &str {
        &self.inner.server_url
    }

    pub async fn status(&self) -> ConnectionStatus {
        let state = self.inner.state.lock().await;
        if state.detecting {
            ConnectionStatus::Detecting
        } else {
            match state.transport {
                Some(kind) => ConnectionStatus::Connected(kind),
                None => ConnectionStatus::Disconnected,
            }
        }
    }

    pub async fn is_connected(&self) -> bool {
        matches!(self.status().await, ConnectionStatus::Connected(_))
    }

    fn next_request_id(&self) -> i64 {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn auth_token(&self) -> Option<&str> {
        self.inner.auth_token.as_deref()
    }

    /// Detect the transport, run the initialize handshake, and discover
    /// tools. On any failure the connection is torn down and the client left
    /// reusable.
    pub async fn connect(&self) -> Result<Vec<ChatToolDefinition>, String> {
        {
            // Claim the state before doing anything. A clone of this client
            // may be connecting concurrently; only one attempt may proceed.
            let mut state = self.inner.state.lock().await;
            if state.transport.is_some() {
                return Err("MCP client is already connected.".to_string());
            }
            if state.detecting {
                return Err("MCP connection attempt already in progress.".to_string());
            }
            state.detecting = true;
        }
        match self.try_connect().await {
            Ok(tools) => Ok(tools),
            Err(err) => {
                self.disconnect().await;
                Err(err)
            }
        }
    }

    async fn try_connect(&self) -> Result<Vec<ChatToolDefinition>, String> {
        let kind = match self.inner.choice.fixed() {
            Some(kind) => kind,
            None => self.detect_transport().await?,
        };
        debug!(url = %self.inner.server_url, ?kind, "MCP transport selected");

        if kind == McpTransportKind::SseLegacy {
            let connection = SseConnection::open(
                &self.inner.http,
                &self.inner.server_url,
                self.auth_token(),
                Arc::clone(&self.inner.pending),
            )
            .await?;
            let mut state = self.inner.state.lock().await;
            state.sse = Some(connection);
        }

        {
            let mut state = self.inner.state.lock().await;
            state.transport = Some(kind);
            state.detecting = false;
        }

        let initialize = self
            .request("initialize", Some(initialize_params()))
            .await?;
        let outcome = parse_initialize(&initialize);
        if let Some(session_id) = outcome.session_id {
            let mut state = self.inner.state.lock().await;
            state.session_id = Some(session_id);
        }

        self.notify("notifications/initialized", None).await?;
        if kind == McpTransportKind::SseLegacy {
            tokio::time::sleep(INITIALIZED_SETTLE_DELAY).await;
        }

        let tools = self.list_tools().await?;
        debug!(
            url = %self.inner.server_url,
            server = outcome.server_name.as_deref().unwrap_or("<unnamed>"),
            tools = tools.len(),
            "MCP server connected"
        );
        Ok(tools)
    }

    async fn detect_transport(&self) -> Result<McpTransportKind, String> {
        let ping = JsonRpcRequest::request(self.next_request_id(), "ping", None);
        match streamable_http::send_rpc(
            &self.inner.http,
            &self.inner.server_url,
            &ping,
            None,
            self.auth_token(),
        )
        .await
        {
            Ok(_) => return Ok(McpTransportKind::StreamableHttp),
            Err(err) => debug!(%err, "Streamable HTTP probe failed"),
        }

        let mut probe = self
            .inner
            .http
            .get(&self.inner.server_url)
            .header("Accept", MCP_SSE_ACCEPT);
        if let Some(token) = self.auth_token() {
            probe = probe.bearer_auth(token);
        }
        match probe.send().await {
            Ok(response)
                if response.status().is_success()
                    && is_event_stream_content_type(&response_content_type(&response)) =>
            {
                return Ok(McpTransportKind::SseLegacy);
            }
            Ok(_) => debug!("SSE probe did not return an event stream"),
            Err(err) => debug!(%err, "SSE probe failed"),
        }

        Err(format!(
            "No supported transport detected for {}",
            self.inner.server_url
        ))
    }

    /// One JSON-RPC round trip over whichever transport is live.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, String> {
        let (transport, session_id, post_url) = {
            let state = self.inner.state.lock().await;
            let transport = state
                .transport
                .ok_or_else(|| "MCP client not connected.".to_string())?;
            let post_url = state
                .sse
                .as_ref()
                .map(|connection| connection.post_url.clone());
            (transport, state.session_id.clone(), post_url)
        };

        let id = self.next_request_id();
        let request = JsonRpcRequest::request(id, method, params);

        match transport {
            McpTransportKind::StreamableHttp => {
                let reply = streamable_http::send_rpc(
                    &self.inner.http,
                    &self.inner.server_url,
                    &request,
                    session_id.as_deref(),
                    self.auth_token(),
                )
                .await?;
                reply.into_result()
            }
            McpTransportKind::SseLegacy => {
                let post_url =
                    post_url.ok_or_else(|| "SSE endpoint not established.".to_string())?;

                // Register before the POST: a reply can arrive before the
                // POST response does.
                let rx = self.inner.pending.register(id);

                if let Err(err) = streamable_http::send_notification(
                    &self.inner.http,
                    &post_url,
                    &request,
                    session_id.as_deref(),
                    self.auth_token(),
                )
                .await
                {
                    self.inner.pending.remove(id);
                    return Err(err);
                }

                match tokio::time::timeout(self.inner.request_timeout, rx).await {
                    Ok(Ok(reply)) => reply.into_result(),
                    Ok(Err(_)) => {
                        self.inner.pending.remove(id);
                        Err("Connection closed while awaiting reply.".to_string())
                    }
                    Err(_) => {
                        self.inner.pending.remove(id);
                        Err(format!(
                            "MCP request timed out after {}s: {method}",
                            self.inner.request_timeout.as_secs()
                        ))
                    }
                }
            }
        }
    }

    /// Fire-and-forget notification; no id is assigned and no reply awaited.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), String> {
        let (transport, session_id, post_url) = {
            let state = self.inner.state.lock().await;
            let transport = state
                .transport
                .ok_or_else(|| "MCP client not connected.".to_string())?;
            let post_url = state
                .sse
                .as_ref()
                .map(|connection| connection.post_url.clone());
            (transport, state.session_id.clone(), post_url)
        };

        let notification = JsonRpcRequest::notification(method, params);
        let url = match transport {
            McpTransportKind::StreamableHttp => self.inner.server_url.clone(),
            McpTransportKind::SseLegacy => {
                post_url.ok_or_else(|| "SSE endpoint not established.".to_string())?
            }
        };
        streamable_http::send_notification(
            &self.inner.http,
            &url,
            &notification,
            session_id.as_deref(),
            self.auth_token(),
        )
        .await
    }

    pub async fn list_tools(&self) -> Result<Vec<ChatToolDefinition>, String> {
        let result = self.request("tools/list", None).await?;
        parse_tools_list(&result)
    }

    /// Invoke one remote tool and normalize its result content to text.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<String, String> {
        let result = self
            .request(
                "tools/call",
                Some(serde_json::json!({"name": name, "arguments": arguments})),
            )
            .await?;
        Ok(normalize_tool_result(&result))
    }

    /// Close the live transport, abandon pending requests, and reset all
    /// state so the client can be connected again.
    pub async fn disconnect(&self) {
        let mut state = self.inner.state.lock().await;
        if let Some(connection) = state.sse.take() {
            connection.close();
        }
        self.inner.pending.clear();
        if state.transport.is_some() {
            debug!(url = %self.inner.server_url, "MCP server disconnected");
        }
        state.transport = None;
        state.session_id = None;
        state.detecting = false;
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.pending.clear();
    }
}
