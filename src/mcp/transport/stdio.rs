//! Subprocess transport: newline-delimited JSON-RPC over the child's stdio.

use super::{
    notification_message, reply_to_server_request, request_message, McpTransport,
    TransportTimeouts,
};
use crate::mcp::descriptor::TransportKind;
use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{NotificationFromClient, RequestFromClient, ServerMessage};
use rust_mcp_schema::RequestId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<ServerMessage>>>>;
type SharedStdin = Arc<Mutex<Option<ChildStdin>>>;

const STDIO_WRITE_TIMEOUT_SECONDS: u64 = 10;

pub struct StdioTransport {
    server_id: String,
    stdin: SharedStdin,
    pending: PendingMap,
    next_request_id: AtomicI64,
    shutdown: CancellationToken,
    request_timeout: Duration,
}

impl StdioTransport {
    /// Spawns the server process. Failing to spawn is returned as-is; the
    /// negotiator treats it as fatal.
    pub fn spawn(
        server_id: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        timeouts: TransportTimeouts,
    ) -> Result<Self, String> {
        debug!(server_id = %server_id, command = %command, args = ?args, "Starting MCP stdio server");
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| err.to_string())?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| "Unable to retrieve stdin.".to_string())?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| "Unable to retrieve stdout.".to_string())?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| "Unable to retrieve stderr.".to_string())?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let stdin: SharedStdin = Arc::new(Mutex::new(Some(stdin)));
        let shutdown = CancellationToken::new();

        spawn_stdout_reader(
            server_id.to_string(),
            stdout,
            pending.clone(),
            stdin.clone(),
        );
        spawn_stderr_drain(server_id.to_string(), stderr);

        {
            let pending = pending.clone();
            let shutdown = shutdown.clone();
            let server_id = server_id.to_string();
            tokio::spawn(async move {
                tokio::select! {
                    status = child.wait() => {
                        debug!(server_id = %server_id, status = ?status, "MCP stdio server exited");
                    }
                    _ = shutdown.cancelled() => {
                        if let Err(err) = child.kill().await {
                            debug!(server_id = %server_id, error = %err, "Failed to kill MCP stdio server");
                        }
                    }
                }
                // Dropping the senders fails every waiter with "connection closed".
                pending.lock().await.clear();
            });
        }

        Ok(Self {
            server_id: server_id.to_string(),
            stdin,
            pending,
            next_request_id: AtomicI64::new(0),
            shutdown,
            request_timeout: timeouts.request,
        })
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Integer(self.next_request_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn write_line(&self, payload: &str) -> Result<(), String> {
        write_line(&self.stdin, payload).await
    }
}

async fn write_line(stdin: &SharedStdin, payload: &str) -> Result<(), String> {
    let write_timeout = Duration::from_secs(STDIO_WRITE_TIMEOUT_SECONDS);
    let mut guard = stdin.lock().await;
    let Some(stdin) = guard.as_mut() else {
        return Err("MCP error -32000: Connection closed".to_string());
    };
    let write = async {
        stdin.write_all(payload.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    };
    tokio::time::timeout(write_timeout, write)
        .await
        .map_err(|_| "Timed out writing MCP stdio request.".to_string())?
        .map_err(|err| err.to_string())
}

fn spawn_stdout_reader(
    server_id: String,
    stdout: tokio::process::ChildStdout,
    pending: PendingMap,
    stdin: SharedStdin,
) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            let value = match serde_json::from_str::<serde_json::Value>(&line) {
                Ok(value) => value,
                Err(_) => continue,
            };
            let items = match value {
                serde_json::Value::Array(items) => items,
                single => vec![single],
            };
            for item in items {
                if let Ok(message) = serde_json::from_value::<ServerMessage>(item) {
                    dispatch_message(&server_id, message, &pending, &stdin).await;
                }
            }
        }
        debug!(server_id = %server_id, "MCP stdio stdout closed");
        pending.lock().await.clear();
    });
}

fn spawn_stderr_drain(server_id: String, stderr: tokio::process::ChildStderr) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                debug!(server_id = %server_id, "[stderr] {trimmed}");
            }
        }
    });
}

async fn dispatch_message(
    server_id: &str,
    message: ServerMessage,
    pending: &PendingMap,
    stdin: &SharedStdin,
) {
    match &message {
        ServerMessage::Response(response) => {
            if let Some(tx) = pending.lock().await.remove(&response.id) {
                let _ = tx.send(message);
            }
        }
        ServerMessage::Error(error) => {
            if let Some(id) = error.id.as_ref() {
                if let Some(tx) = pending.lock().await.remove(id) {
                    let _ = tx.send(message);
                }
            }
        }
        ServerMessage::Request(request) => {
            debug!(server_id = %server_id, method = %request.method(), "Received MCP stdio request");
            let reply = reply_to_server_request(request).to_string();
            if let Err(err) = write_line(stdin, &reply).await {
                warn!(server_id = %server_id, error = %err, "Failed to answer MCP server request");
            }
        }
        ServerMessage::Notification(_) => {
            debug!(server_id = %server_id, "Received MCP stdio notification");
        }
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Process
    }

    async fn send_request(&self, request: RequestFromClient) -> Result<ServerMessage, String> {
        let request_id = self.next_request_id();
        let message = request_message(request, request_id.clone())?;
        let payload = serde_json::to_string(&message).map_err(|err| err.to_string())?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        debug!(server_id = %self.server_id, request_id = ?request_id, "Sending MCP stdio request");
        if let Err(err) = self.write_line(&payload).await {
            self.pending.lock().await.remove(&request_id);
            return Err(err);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err("MCP error -32000: Connection closed".to_string()),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err("MCP stdio request timed out.".to_string())
            }
        }
    }

    async fn send_notification(&self, notification: NotificationFromClient) -> Result<(), String> {
        let message = notification_message(notification)?;
        let payload = serde_json::to_string(&message).map_err(|err| err.to_string())?;
        self.write_line(&payload).await
    }

    async fn close(&self) -> Result<(), String> {
        self.stdin.lock().await.take();
        self.shutdown.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_fails_for_missing_command() {
        let err = match StdioTransport::spawn(
            "missing",
            "/definitely-missing-command",
            &[],
            &HashMap::new(),
            TransportTimeouts::default(),
        ) {
            Ok(_) => panic!("spawn should fail"),
            Err(err) => err,
        };
        assert!(!err.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn request_fails_once_process_exits() {
        let transport = StdioTransport::spawn(
            "quiet",
            "true",
            &[],
            &HashMap::new(),
            TransportTimeouts {
                connect: Duration::from_secs(1),
                request: Duration::from_secs(5),
            },
        )
        .expect("`true` should spawn");

        let err = transport
            .send_request(RequestFromClient::PingRequest(None))
            .await
            .expect_err("exited process cannot answer");
        assert!(err.contains("-32000") || err.contains("Broken pipe") || err.contains("os error"));
        transport.close().await.expect("close is infallible");
        transport.close().await.expect("second close is harmless");
    }
}
