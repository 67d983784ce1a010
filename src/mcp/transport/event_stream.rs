//! Legacy event-stream transport: a long-lived GET stream carries server
//! messages and announces the endpoint that client messages are POSTed to.
//!
//! This transport does not forward custom headers.

use super::{
    build_mcp_http_client, is_event_stream_content_type, notification_message,
    reply_to_server_request, request_message, sse_data_payload, sse_event_name, McpTransport,
    SseLineBuffer, TransportTimeouts, MCP_JSON_CONTENT_TYPE,
};
use crate::mcp::descriptor::TransportKind;
use crate::utils::url::redacted_url;
use async_trait::async_trait;
use futures_util::StreamExt;
use rust_mcp_schema::schema_utils::{
    ClientMessage, NotificationFromClient, RequestFromClient, ServerMessage,
};
use rust_mcp_schema::RequestId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<ServerMessage>>>>;

pub struct EventStreamTransport {
    server_id: String,
    endpoint: String,
    client: reqwest::Client,
    pending: PendingMap,
    next_request_id: AtomicI64,
    shutdown: CancellationToken,
    request_timeout: Duration,
}

impl EventStreamTransport {
    /// Opens the stream and waits for the server to announce its POST
    /// endpoint.
    pub async fn connect(
        server_id: &str,
        url: &str,
        timeouts: TransportTimeouts,
    ) -> Result<Self, String> {
        let client = build_mcp_http_client(timeouts)?;
        let base = reqwest::Url::parse(url).map_err(|err| err.to_string())?;

        let response = tokio::time::timeout(
            timeouts.connect,
            client.get(base.clone()).header("Accept", "text/event-stream").send(),
        )
        .await
        .map_err(|_| "Timed out opening the event stream.".to_string())?
        .map_err(|err| err.to_string())?;

        if !response.status().is_success() {
            return Err(format!("HTTP error: {}", response.status()));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        if !is_event_stream_content_type(content_type) {
            return Err(format!(
                "Expected an event stream but the server answered with `{content_type}`."
            ));
        }

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        let (endpoint_tx, endpoint_rx) = oneshot::channel();

        let reader = StreamReader {
            server_id: server_id.to_string(),
            base,
            client: client.clone(),
            pending: pending.clone(),
            endpoint: None,
            endpoint_tx: Some(endpoint_tx),
        };
        tokio::spawn(read_until_closed(reader, response, shutdown.clone()));

        let endpoint = match tokio::time::timeout(timeouts.connect, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => {
                shutdown.cancel();
                return Err("MCP error -32000: Connection closed".to_string());
            }
            Err(_) => {
                shutdown.cancel();
                return Err("Timed out waiting for the event-stream endpoint.".to_string());
            }
        };
        debug!(server_id = %server_id, endpoint = %redacted_url(&endpoint), "MCP event stream ready");

        Ok(Self {
            server_id: server_id.to_string(),
            endpoint,
            client,
            pending,
            next_request_id: AtomicI64::new(0),
            shutdown,
            request_timeout: timeouts.request,
        })
    }

    async fn post(&self, message: &ClientMessage) -> Result<(), String> {
        let payload = serde_json::to_string(message).map_err(|err| err.to_string())?;
        post_payload(&self.client, &self.endpoint, payload, Some(self.request_timeout)).await
    }
}

async fn post_payload(
    client: &reqwest::Client,
    endpoint: &str,
    payload: String,
    timeout: Option<Duration>,
) -> Result<(), String> {
    let mut request = client
        .post(endpoint)
        .header("Content-Type", MCP_JSON_CONTENT_TYPE)
        .body(payload);
    if let Some(timeout) = timeout {
        request = request.timeout(timeout);
    }
    let response = request.send().await.map_err(|err| err.to_string())?;
    if !response.status().is_success() {
        return Err(format!("HTTP error: {}", response.status()));
    }
    Ok(())
}

/// Runs the reader until the stream ends or the transport is closed. An
/// ended stream marks the transport closed so later requests fail fast.
async fn read_until_closed(
    reader: StreamReader,
    response: reqwest::Response,
    shutdown: CancellationToken,
) {
    tokio::select! {
        _ = reader.run(response) => shutdown.cancel(),
        _ = shutdown.cancelled() => {}
    }
}

struct StreamReader {
    server_id: String,
    base: reqwest::Url,
    client: reqwest::Client,
    pending: PendingMap,
    endpoint: Option<String>,
    endpoint_tx: Option<oneshot::Sender<String>>,
}

impl StreamReader {
    async fn run(mut self, response: reqwest::Response) {
        let mut stream = response.bytes_stream();
        let mut buffer = SseLineBuffer::default();
        let mut event = None::<String>;

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    debug!(server_id = %self.server_id, error = %err, "MCP event stream failed");
                    break;
                }
            };
            for line in buffer.push(&chunk) {
                self.handle_line(&line, &mut event).await;
            }
        }
        for line in buffer.finish() {
            self.handle_line(&line, &mut event).await;
        }

        debug!(server_id = %self.server_id, "MCP event stream closed");
        self.pending.lock().await.clear();
    }

    async fn handle_line(&mut self, line: &str, event: &mut Option<String>) {
        if let Some(name) = sse_event_name(line) {
            *event = Some(name.to_string());
            return;
        }
        let Some(payload) = sse_data_payload(line) else {
            return;
        };
        let event_name = event.take();

        if event_name.as_deref() == Some("endpoint") {
            match self.base.join(payload) {
                Ok(endpoint) => {
                    let endpoint = endpoint.to_string();
                    self.endpoint = Some(endpoint.clone());
                    if let Some(tx) = self.endpoint_tx.take() {
                        let _ = tx.send(endpoint);
                    }
                }
                Err(err) => {
                    warn!(server_id = %self.server_id, error = %err, "Invalid event-stream endpoint");
                }
            }
            return;
        }

        if payload.is_empty() {
            return;
        }
        let Ok(message) = serde_json::from_str::<ServerMessage>(payload) else {
            debug!(server_id = %self.server_id, "Skipping undecodable event-stream payload");
            return;
        };
        self.dispatch(message).await;
    }

    async fn dispatch(&self, message: ServerMessage) {
        match &message {
            ServerMessage::Response(response) => {
                if let Some(tx) = self.pending.lock().await.remove(&response.id) {
                    let _ = tx.send(message);
                }
            }
            ServerMessage::Error(error) => {
                if let Some(id) = error.id.as_ref() {
                    if let Some(tx) = self.pending.lock().await.remove(id) {
                        let _ = tx.send(message);
                    }
                }
            }
            ServerMessage::Request(request) => {
                let Some(endpoint) = self.endpoint.as_deref() else {
                    return;
                };
                let reply = reply_to_server_request(request).to_string();
                if let Err(err) = post_payload(&self.client, endpoint, reply, None).await {
                    warn!(server_id = %self.server_id, error = %err, "Failed to answer MCP server request");
                }
            }
            ServerMessage::Notification(_) => {}
        }
    }
}

#[async_trait]
impl McpTransport for EventStreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::EventStream
    }

    async fn send_request(&self, request: RequestFromClient) -> Result<ServerMessage, String> {
        if self.shutdown.is_cancelled() {
            return Err("MCP error -32000: Connection closed".to_string());
        }
        let request_id = RequestId::Integer(self.next_request_id.fetch_add(1, Ordering::SeqCst));
        let message = request_message(request, request_id.clone())?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        debug!(server_id = %self.server_id, request_id = ?request_id, "Sending MCP event-stream request");
        if let Err(err) = self.post(&message).await {
            self.pending.lock().await.remove(&request_id);
            return Err(err);
        }

        let waited = tokio::select! {
            waited = tokio::time::timeout(self.request_timeout, rx) => waited,
            _ = self.shutdown.cancelled() => {
                self.pending.lock().await.remove(&request_id);
                return Err("MCP error -32000: Connection closed".to_string());
            }
        };
        match waited {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err("MCP error -32000: Connection closed".to_string()),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err("MCP event-stream request timed out.".to_string())
            }
        }
    }

    async fn send_notification(&self, notification: NotificationFromClient) -> Result<(), String> {
        let message = notification_message(notification)?;
        self.post(&message).await
    }

    async fn close(&self) -> Result<(), String> {
        self.shutdown.cancel();
        self.pending.lock().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(base: &str) -> (StreamReader, oneshot::Receiver<String>) {
        let (tx, rx) = oneshot::channel();
        let reader = StreamReader {
            server_id: "events".to_string(),
            base: reqwest::Url::parse(base).expect("url"),
            client: reqwest::Client::new(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            endpoint: None,
            endpoint_tx: Some(tx),
        };
        (reader, rx)
    }

    #[tokio::test]
    async fn endpoint_event_resolves_relative_path() {
        let (mut reader, rx) = reader("https://mcp.example.com/sse");
        let mut event = None;
        reader.handle_line("event: endpoint", &mut event).await;
        reader
            .handle_line("data: /messages?sessionId=abc", &mut event)
            .await;

        assert_eq!(
            rx.await.expect("endpoint announced"),
            "https://mcp.example.com/messages?sessionId=abc"
        );
        assert!(event.is_none());
    }

    #[tokio::test]
    async fn ended_stream_fails_later_requests_immediately() {
        let (reader, rx) = reader("https://mcp.example.com/sse");
        let pending = reader.pending.clone();
        let shutdown = CancellationToken::new();
        let body = "event: endpoint\ndata: /messages?sessionId=abc\n\n".to_string();
        let response = reqwest::Response::from(axum::http::Response::new(body));

        read_until_closed(reader, response, shutdown.clone()).await;
        assert_eq!(
            rx.await.expect("endpoint announced"),
            "https://mcp.example.com/messages?sessionId=abc"
        );
        assert!(shutdown.is_cancelled());

        let transport = EventStreamTransport {
            server_id: "events".to_string(),
            endpoint: "https://mcp.example.com/messages?sessionId=abc".to_string(),
            client: reqwest::Client::new(),
            pending,
            next_request_id: AtomicI64::new(0),
            shutdown,
            request_timeout: Duration::from_secs(60),
        };
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            transport.send_request(RequestFromClient::ListToolsRequest(None)),
        )
        .await
        .expect("request fails without waiting for the request timeout");
        let err = result.expect_err("closed transport rejects requests");
        assert!(err.contains("-32000"));
        assert!(transport.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn responses_are_routed_to_pending_requests() {
        let (mut reader, _rx) = reader("https://mcp.example.com/sse");
        let (tx, rx) = oneshot::channel();
        reader
            .pending
            .lock()
            .await
            .insert(RequestId::Integer(4), tx);

        let mut event = None;
        reader.handle_line("event: message", &mut event).await;
        reader
            .handle_line(r#"data: {"jsonrpc":"2.0","id":4,"result":{"tools":[]}}"#, &mut event)
            .await;

        let message = rx.await.expect("response delivered");
        assert!(matches!(message, ServerMessage::Response(_)));
        assert!(reader.pending.lock().await.is_empty());
    }
}
