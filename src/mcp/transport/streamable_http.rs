//! Streamable HTTP transport: one POST per JSON-RPC message, answered with
//! either a JSON body or a short-lived event stream.

use super::{
    apply_custom_headers, build_mcp_http_client, is_event_stream_content_type,
    notification_message, reply_to_server_request, request_message, sse_data_payload,
    McpTransport, SseLineBuffer, TransportTimeouts, MCP_JSON_AND_SSE_ACCEPT,
    MCP_JSON_CONTENT_TYPE, MCP_PROTOCOL_VERSION_HEADER, MCP_SESSION_ID_HEADER,
};
use crate::mcp::descriptor::TransportKind;
use crate::utils::url::redacted_url;
use async_trait::async_trait;
use futures_util::StreamExt;
use rust_mcp_schema::schema_utils::{
    ClientMessage, NotificationFromClient, RequestFromClient, ServerJsonrpcRequest, ServerMessage,
};
use rust_mcp_schema::{RequestId, LATEST_PROTOCOL_VERSION};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

pub struct StreamableHttpTransport {
    server_id: String,
    url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
    session_id: Mutex<Option<String>>,
    protocol_version: Mutex<Option<String>>,
    next_request_id: AtomicI64,
    request_timeout: Duration,
}

impl StreamableHttpTransport {
    pub fn new(
        server_id: &str,
        url: &str,
        headers: &HashMap<String, String>,
        timeouts: TransportTimeouts,
    ) -> Result<Self, String> {
        Ok(Self {
            server_id: server_id.to_string(),
            url: url.to_string(),
            headers: headers.clone(),
            client: build_mcp_http_client(timeouts)?,
            session_id: Mutex::new(None),
            protocol_version: Mutex::new(None),
            next_request_id: AtomicI64::new(0),
            request_timeout: timeouts.request,
        })
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.lock().ok().and_then(|guard| guard.clone())
    }

    fn store_session_id(&self, response: &reqwest::Response) {
        let Some(session_id) = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string())
        else {
            return;
        };
        if let Ok(mut guard) = self.session_id.lock() {
            *guard = Some(session_id);
        }
    }

    fn protocol_version(&self) -> String {
        self.protocol_version
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .filter(|version| !version.trim().is_empty())
            .unwrap_or_else(|| LATEST_PROTOCOL_VERSION.to_string())
    }

    fn post(&self, payload: String) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", MCP_JSON_CONTENT_TYPE)
            .header("Accept", MCP_JSON_AND_SSE_ACCEPT)
            .header(MCP_PROTOCOL_VERSION_HEADER, self.protocol_version())
            .timeout(self.request_timeout)
            .body(payload);
        request = apply_custom_headers(request, &self.headers);
        if let Some(session_id) = self.session_id() {
            request = request.header(MCP_SESSION_ID_HEADER, session_id);
        }
        request
    }

    async fn send_message(&self, message: &ClientMessage) -> Result<reqwest::Response, String> {
        let payload = serde_json::to_string(message).map_err(|err| err.to_string())?;
        let response = self
            .post(payload)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP error: {}", response.status()));
        }
        self.store_session_id(&response);
        Ok(response)
    }

    async fn answer_server_requests(&self, requests: Vec<ServerJsonrpcRequest>) {
        for request in requests {
            let reply = reply_to_server_request(&request).to_string();
            let result = self.post(reply).send().await;
            if let Err(err) = result {
                warn!(server_id = %self.server_id, error = %err, "Failed to answer MCP server request");
            }
        }
    }
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn send_request(&self, request: RequestFromClient) -> Result<ServerMessage, String> {
        let request_id = RequestId::Integer(self.next_request_id.fetch_add(1, Ordering::SeqCst));
        let message = request_message(request, request_id)?;
        debug!(server_id = %self.server_id, url = %redacted_url(&self.url), "Sending MCP HTTP request");
        let response = self.send_message(&message).await?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();

        if is_event_stream_content_type(&content_type) {
            let mut server_requests = Vec::new();
            let message = next_sse_server_message(response, |message| {
                if let ServerMessage::Request(request) = message {
                    server_requests.push(request.clone());
                }
            })
            .await?;
            self.answer_server_requests(server_requests).await;
            Ok(message)
        } else {
            let body = response.bytes().await.map_err(|err| err.to_string())?;
            serde_json::from_slice::<ServerMessage>(&body).map_err(|err| err.to_string())
        }
    }

    async fn send_notification(&self, notification: NotificationFromClient) -> Result<(), String> {
        let message = notification_message(notification)?;
        self.send_message(&message).await.map(|_| ())
    }

    async fn close(&self) -> Result<(), String> {
        let session_id = self
            .session_id
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        let Some(session_id) = session_id else {
            return Ok(());
        };
        let request = apply_custom_headers(
            self.client
                .delete(&self.url)
                .header(MCP_SESSION_ID_HEADER, session_id)
                .timeout(self.request_timeout),
            &self.headers,
        );
        // Servers may answer 405 when they do not support explicit termination.
        match request.send().await {
            Ok(response) => {
                debug!(server_id = %self.server_id, status = %response.status(), "Closed MCP HTTP session");
                Ok(())
            }
            Err(err) => Err(err.to_string()),
        }
    }

    fn set_protocol_version(&self, protocol_version: &str) {
        if let Ok(mut guard) = self.protocol_version.lock() {
            *guard = Some(protocol_version.to_string());
        }
    }
}

/// Reads an event-stream response until the first response or error message.
pub async fn next_sse_server_message(
    response: reqwest::Response,
    mut on_message: impl FnMut(&ServerMessage),
) -> Result<ServerMessage, String> {
    let mut stream = response.bytes_stream();
    let mut buffer = SseLineBuffer::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| err.to_string())?;
        for line in buffer.push(&chunk) {
            if let Some(message) = decode_sse_line(&line)? {
                on_message(&message);
                if is_reply(&message) {
                    return Ok(message);
                }
            }
        }
    }

    for line in buffer.finish() {
        if let Some(message) = decode_sse_line(&line)? {
            on_message(&message);
            if is_reply(&message) {
                return Ok(message);
            }
        }
    }

    Err("Empty event-stream response.".to_string())
}

fn is_reply(message: &ServerMessage) -> bool {
    matches!(message, ServerMessage::Response(_) | ServerMessage::Error(_))
}

fn decode_sse_line(line: &str) -> Result<Option<ServerMessage>, String> {
    let Some(payload) = sse_data_payload(line) else {
        return Ok(None);
    };
    if payload.is_empty() {
        return Ok(None);
    }
    serde_json::from_str::<ServerMessage>(payload)
        .map(Some)
        .map_err(|err| err.to_string())
}
