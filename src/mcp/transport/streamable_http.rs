//! Streamable HTTP transport: each JSON-RPC message is a single POST.
//!
//! Servers answer either with a plain JSON body or with a short event stream;
//! in the latter case the first well-formed message is the logical reply and
//! anything after it is ignored for correlation purposes.

use futures_util::StreamExt;
use tracing::debug;

use super::{
    is_event_stream_content_type, response_content_type, SseEvent, SseEventBuffer,
    MCP_JSON_AND_SSE_ACCEPT, MCP_JSON_CONTENT_TYPE, SESSION_ID_HEADERS,
};
use crate::mcp::protocol::{JsonRpcRequest, JsonRpcResponse};

pub(crate) fn apply_post_headers(
    mut request: reqwest::RequestBuilder,
    session_id: Option<&str>,
    auth_token: Option<&str>,
) -> reqwest::RequestBuilder {
    request = request
        .header("Content-Type", MCP_JSON_CONTENT_TYPE)
        .header("Accept", MCP_JSON_AND_SSE_ACCEPT);
    if let Some(session_id) = session_id {
        for header in SESSION_ID_HEADERS {
            request = request.header(header, session_id);
        }
    }
    if let Some(token) = auth_token {
        request = request.bearer_auth(token);
    }
    request
}

/// POST one request and return its correlated reply.
pub async fn send_rpc(
    client: &reqwest::Client,
    url: &str,
    request: &JsonRpcRequest,
    session_id: Option<&str>,
    auth_token: Option<&str>,
) -> Result<JsonRpcResponse, String> {
    debug!(url, method = %request.method, "Sending MCP HTTP request");
    let response = apply_post_headers(client.post(url), session_id, auth_token)
        .json(request)
        .send()
        .await
        .map_err(|err| err.to_string())?;

    if !response.status().is_success() {
        return Err(format!("HTTP error: {}", response.status()));
    }

    if is_event_stream_content_type(&response_content_type(&response)) {
        first_stream_reply(response).await
    } else {
        let body = response.bytes().await.map_err(|err| err.to_string())?;
        serde_json::from_slice::<JsonRpcResponse>(&body).map_err(|err| err.to_string())
    }
}

/// POST a notification. No reply is expected; only transport failures and
/// non-2xx statuses are errors.
pub async fn send_notification(
    client: &reqwest::Client,
    url: &str,
    notification: &JsonRpcRequest,
    session_id: Option<&str>,
    auth_token: Option<&str>,
) -> Result<(), String> {
    let response = apply_post_headers(client.post(url), session_id, auth_token)
        .json(notification)
        .send()
        .await
        .map_err(|err| err.to_string())?;

    if !response.status().is_success() {
        return Err(format!("HTTP error: {}", response.status()));
    }
    Ok(())
}

async fn first_stream_reply(response: reqwest::Response) -> Result<JsonRpcResponse, String> {
    let mut stream = response.bytes_stream();
    let mut buffer = SseEventBuffer::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| err.to_string())?;
        if let Some(reply) = first_well_formed(buffer.push(&chunk)) {
            return Ok(reply);
        }
    }
    if let Some(reply) = first_well_formed(buffer.finish()) {
        return Ok(reply);
    }
    Err("Empty event-stream response.".to_string())
}

fn first_well_formed(events: Vec<SseEvent>) -> Option<JsonRpcResponse> {
    events.into_iter().find_map(|event| {
        match serde_json::from_str::<JsonRpcResponse>(&event.data) {
            Ok(reply) if reply.result.is_some() || reply.error.is_some() => Some(reply),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_well_formed_skips_noise_frames() {
        let mut buffer = SseEventBuffer::default();
        let events = buffer.push(
            b": keep-alive\n\ndata: not json\n\ndata: {\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{\"ok\":true}}\n\ndata: {\"jsonrpc\":\"2.0\",\"id\":4,\"result\":{}}\n\n",
        );
        let reply = first_well_formed(events).expect("reply");
        assert_eq!(reply.numeric_id(), Some(3));
    }

    #[test]
    fn frames_without_result_or_error_are_not_replies() {
        let mut buffer = SseEventBuffer::default();
        let events =
            buffer.push(b"data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n");
        assert!(first_well_formed(events).is_none());
    }
}
