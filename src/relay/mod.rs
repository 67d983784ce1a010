//! Drives one model generation per chat turn and multiplexes its text,
//! tool-call announcements and terminal events into a single ordered
//! event stream.

pub mod events;
pub mod model;
pub mod openai;
pub mod results;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::ChatToolDefinition;
use crate::mcp::catalog::Tool;
use crate::mcp::error::InvocationError;
use crate::mcp::{Connection, ConnectionRegistry, ToolCall, ToolInvoker, ToolResult};

pub use events::{encode_event, FunctionCall, StreamErrorCode, StreamEvent};
pub use model::{GenerateRequest, ModelBackend, ModelChunk, ModelError, ModelFunctionCall};
pub use openai::OpenAiBackend;
pub use results::ToolResults;

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub api_key: Option<String>,
    pub model: String,
}

/// Where a relay run stands. A run starts streaming once its preconditions
/// pass and returns the terminal state it ended in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Streaming,
    Completed,
    Failed,
}

/// Forwards events to the client and refuses everything after `done`.
struct EventSink {
    tx: mpsc::UnboundedSender<StreamEvent>,
    done: bool,
}

impl EventSink {
    fn new(tx: mpsc::UnboundedSender<StreamEvent>) -> Self {
        Self { tx, done: false }
    }

    /// Returns false once the receiver is gone.
    fn emit(&mut self, event: StreamEvent) -> bool {
        if self.done {
            return false;
        }
        self.tx.send(event).is_ok()
    }

    fn fail(&mut self, code: StreamErrorCode, message: impl Into<String>) -> RelayState {
        self.emit(StreamEvent::error(code, message));
        self.finish(RelayState::Failed)
    }

    fn finish(&mut self, state: RelayState) -> RelayState {
        self.emit(StreamEvent::Done);
        self.done = true;
        state
    }
}

/// Relays one chat turn at a time per call to [`StreamRelay::run`].
///
/// Tool calls announced by the model are executed in the background against
/// the first participating server, whichever server declared the tool. Their
/// results go to [`ToolResults`] keyed by call id. Cancelling a stream stops
/// model consumption only; tool calls already dispatched run to completion.
pub struct StreamRelay {
    registry: Arc<ConnectionRegistry>,
    invoker: ToolInvoker,
    backend: Arc<dyn ModelBackend>,
    results: Arc<ToolResults>,
    settings: RelaySettings,
    next_stream_id: AtomicU64,
}

impl StreamRelay {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        backend: Arc<dyn ModelBackend>,
        results: Arc<ToolResults>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            invoker: ToolInvoker::new(registry.clone()),
            registry,
            backend,
            results,
            settings,
            next_stream_id: AtomicU64::new(0),
        }
    }

    pub fn results(&self) -> &Arc<ToolResults> {
        &self.results
    }

    /// Runs the relay on a background task and returns the event receiver.
    pub fn spawn(
        self: &Arc<Self>,
        prompt: String,
        enabled_ids: Vec<String>,
        cancel: CancellationToken,
    ) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            relay.run(&prompt, &enabled_ids, tx, cancel).await;
        });
        rx
    }

    /// Streams one turn into `tx`. Exactly one `done` is sent last, whatever
    /// the outcome.
    pub async fn run(
        &self,
        prompt: &str,
        enabled_ids: &[String],
        tx: mpsc::UnboundedSender<StreamEvent>,
        cancel: CancellationToken,
    ) -> RelayState {
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut sink = EventSink::new(tx);

        if self
            .settings
            .api_key
            .as_deref()
            .map_or(true, |key| key.trim().is_empty())
        {
            return sink.fail(
                StreamErrorCode::NoApiKey,
                "No model API key is configured. Set LLM_API_KEY.",
            );
        }
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return sink.fail(StreamErrorCode::NoPrompt, "A prompt is required.");
        }

        debug!(stream_id, state = ?RelayState::Streaming, "Relay stream started");

        let participating = self.participating_ids(enabled_ids).await;
        let (enabled, declarations) = self.tool_declarations(&participating).await;
        if !enabled.is_empty() {
            info!(stream_id, servers = ?enabled, tools = declarations.len(), "MCP tools enabled for stream");
            sink.emit(StreamEvent::McpInfo {
                enabled_servers: enabled.clone(),
            });
        }

        let request = GenerateRequest {
            model: self.settings.model.clone(),
            prompt: prompt.to_string(),
            tools: (!declarations.is_empty()).then_some(declarations),
        };

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(stream_id, "Relay cancelled before the model answered");
                return sink.finish(RelayState::Completed);
            }
            opened = self.backend.generate_stream(request) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(err) => return self.model_failed(stream_id, &mut sink, err),
        };

        let target = enabled.first().cloned();
        let mut call_seq = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(stream_id, "Relay cancelled");
                    break;
                }
                next = stream.next() => next,
            };

            let chunk = match next {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => return self.model_failed(stream_id, &mut sink, err),
            };

            if !chunk.function_calls.is_empty() {
                let calls: Vec<FunctionCall> = chunk
                    .function_calls
                    .into_iter()
                    .map(|call| {
                        call_seq += 1;
                        FunctionCall {
                            id: call
                                .id
                                .filter(|id| !id.is_empty())
                                .unwrap_or_else(|| format!("call-{stream_id}-{call_seq}")),
                            name: call.name,
                            args: call.args,
                        }
                    })
                    .collect();
                let delivered = sink.emit(StreamEvent::FunctionCalls {
                    calls: calls.clone(),
                });
                self.dispatch(&calls, target.as_deref());
                if !delivered {
                    debug!(stream_id, "Relay client went away");
                    break;
                }
            }

            if let Some(delta) = chunk.text.filter(|delta| !delta.is_empty()) {
                if !sink.emit(StreamEvent::Text { delta }) {
                    debug!(stream_id, "Relay client went away");
                    break;
                }
            }
        }

        debug!(stream_id, "Relay stream finished");
        sink.finish(RelayState::Completed)
    }

    fn model_failed(&self, stream_id: u64, sink: &mut EventSink, err: ModelError) -> RelayState {
        let code = err.code();
        warn!(stream_id, status = ?err.status, code = ?code, error = %err, "Model stream failed");
        sink.fail(code, err.message)
    }

    /// Requested ids that survive validation, in request order.
    async fn participating_ids(&self, requested: &[String]) -> Vec<String> {
        if requested.is_empty() {
            return Vec::new();
        }
        let valid: HashSet<String> = self.registry.validate_all().await.into_iter().collect();
        let mut seen = HashSet::new();
        let mut participating = Vec::new();
        for id in requested.iter().map(|id| id.trim()) {
            if id.is_empty() || !seen.insert(id.to_string()) {
                continue;
            }
            if valid.contains(id) {
                participating.push(id.to_string());
            } else {
                warn!(server_id = %id, "Ignoring enabled MCP server that is not connected");
            }
        }
        participating
    }

    /// Converts each server's tools into model declarations. A server whose
    /// conversion fails is skipped; a tool name already declared by an
    /// earlier server is dropped.
    async fn tool_declarations(&self, ids: &[String]) -> (Vec<String>, Vec<ChatToolDefinition>) {
        let mut enabled = Vec::new();
        let mut declarations = Vec::new();
        let mut names = HashSet::new();

        for id in ids {
            let Some(connection) = self.registry.get(id).await else {
                continue;
            };
            match server_declarations(&connection) {
                Ok(tools) => {
                    enabled.push(id.clone());
                    for tool in tools {
                        if names.insert(tool.function.name.clone()) {
                            declarations.push(tool);
                        } else {
                            debug!(server_id = %id, tool = %tool.function.name, "Skipping duplicate tool name");
                        }
                    }
                }
                Err(err) => {
                    warn!(server_id = %id, error = %err, "Skipping MCP server whose tools cannot be declared");
                }
            }
        }
        (enabled, declarations)
    }

    fn dispatch(&self, calls: &[FunctionCall], target: Option<&str>) {
        for call in calls {
            self.results.expect(&call.id);
            let Some(server_id) = target.map(str::to_string) else {
                self.results.publish(
                    &call.id,
                    ToolResult::error(
                        "Function execution error: no MCP server is enabled for this stream",
                    ),
                );
                continue;
            };

            let invoker = self.invoker.clone();
            let results = self.results.clone();
            let call_id = call.id.clone();
            let tool_call = ToolCall {
                name: call.name.clone(),
                arguments: call.args.clone(),
            };
            tokio::spawn(async move {
                let result = match invoker.call_tool(&server_id, &tool_call).await {
                    Ok(result) => result,
                    Err(err) => {
                        warn!(server_id = %server_id, call_id = %call_id, error = %err, "Tool call failed");
                        ToolResult::error(format!("Function execution error: {err}"))
                    }
                };
                results.publish(&call_id, result);
            });
        }
    }

    /// Executes one call directly, outside any stream.
    pub async fn execute_function(
        &self,
        server_id: &str,
        call: &ToolCall,
    ) -> Result<ToolResult, InvocationError> {
        self.invoker.call_tool(server_id, call).await
    }
}

fn server_declarations(connection: &Connection) -> Result<Vec<ChatToolDefinition>, String> {
    connection.catalog.tools.iter().map(tool_declaration).collect()
}

pub(crate) fn tool_declaration(tool: &Tool) -> Result<ChatToolDefinition, String> {
    if !is_valid_function_name(&tool.name) {
        return Err(format!("`{}` is not a valid function name", tool.name));
    }
    jsonschema::validator_for(&tool.input_schema)
        .map_err(|err| format!("tool `{}` has an invalid input schema: {err}", tool.name))?;
    Ok(ChatToolDefinition::function(
        tool.name.clone(),
        tool.description.clone(),
        tool.input_schema.clone(),
    ))
}

fn is_valid_function_name(name: &str) -> bool {
    (1..=64).contains(&name.len())
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}
