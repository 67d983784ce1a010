//! OpenAI-compatible `chat/completions` streaming backend.

use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::model::{
    GenerateRequest, ModelBackend, ModelChunk, ModelError, ModelFunctionCall, ModelStream,
};
use crate::api::{ChatMessage, ChatRequest, ChatResponse, ChatToolCallDelta};
use crate::mcp::transport::{sse_data_payload, SseLineBuffer};
use crate::utils::url::{construct_api_url, redacted_url};

type ByteStream = BoxStream<'static, Result<Vec<u8>, String>>;

pub struct OpenAiBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiBackend {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl ModelBackend for OpenAiBackend {
    async fn generate_stream(&self, request: GenerateRequest) -> Result<ModelStream, ModelError> {
        let chat_url = construct_api_url(&self.base_url, "chat/completions");
        debug!(
            url = %redacted_url(&chat_url),
            model = %request.model,
            tools = request.tools.as_ref().map_or(0, Vec::len),
            "Opening model stream"
        );

        let body = ChatRequest {
            model: request.model,
            messages: vec![ChatMessage::user(request.prompt)],
            stream: true,
            tools: request.tools,
        };

        let response = self
            .client
            .post(chat_url)
            .header("Content-Type", "application/json")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                ModelError::new(
                    err.status().map(|status| status.as_u16()),
                    format_api_error(&err.to_string()),
                )
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            return Err(ModelError::new(Some(status), format_api_error(&error_text)));
        }

        let bytes: ByteStream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(|err| err.to_string()))
            .boxed();
        Ok(decode_stream(bytes))
    }
}

/// Turns a raw SSE byte stream into model chunks. Text is yielded as it
/// arrives; tool calls are yielded once their arguments are complete.
fn decode_stream(bytes: ByteStream) -> ModelStream {
    let state = DecodeState {
        bytes,
        lines: SseLineBuffer::default(),
        decoder: ChunkDecoder::default(),
        queue: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.queue.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    for line in state.lines.push(&chunk) {
                        if state.decoder.process_line(&line, &mut state.queue) {
                            state.finished = true;
                            break;
                        }
                    }
                }
                Some(Err(err)) => {
                    state
                        .queue
                        .push_back(Err(ModelError::new(None, format_api_error(&err))));
                    state.finished = true;
                }
                None => {
                    for line in state.lines.finish() {
                        if state.decoder.process_line(&line, &mut state.queue) {
                            break;
                        }
                    }
                    state.decoder.flush_calls(&mut state.queue);
                    state.finished = true;
                }
            }
        }
    })
    .boxed()
}

struct DecodeState {
    bytes: ByteStream,
    lines: SseLineBuffer,
    decoder: ChunkDecoder,
    queue: VecDeque<Result<ModelChunk, ModelError>>,
    finished: bool,
}

#[derive(Default)]
struct PendingToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

#[derive(Default)]
struct ChunkDecoder {
    pending: BTreeMap<u32, PendingToolCall>,
}

impl ChunkDecoder {
    /// Returns true once the stream has ended, either with `[DONE]` or an
    /// error payload.
    fn process_line(
        &mut self,
        line: &str,
        out: &mut VecDeque<Result<ModelChunk, ModelError>>,
    ) -> bool {
        sse_data_payload(line)
            .map(|payload| self.handle_data_payload(payload, out))
            .unwrap_or(false)
    }

    fn handle_data_payload(
        &mut self,
        payload: &str,
        out: &mut VecDeque<Result<ModelChunk, ModelError>>,
    ) -> bool {
        if payload == "[DONE]" {
            self.flush_calls(out);
            return true;
        }

        match serde_json::from_str::<ChatResponse>(payload) {
            Ok(response) => {
                let Some(choice) = response.choices.into_iter().next() else {
                    return false;
                };
                if let Some(content) = choice.delta.content.filter(|content| !content.is_empty()) {
                    out.push_back(Ok(ModelChunk::text(content)));
                }
                for delta in choice.delta.tool_calls.unwrap_or_default() {
                    self.append_tool_call_delta(delta);
                }
                if choice.finish_reason.is_some() {
                    self.flush_calls(out);
                }
                false
            }
            Err(_) => {
                if payload.trim().is_empty() {
                    return false;
                }
                out.push_back(Err(ModelError::new(None, format_api_error(payload))));
                true
            }
        }
    }

    fn append_tool_call_delta(&mut self, delta: ChatToolCallDelta) {
        let entry = self.pending.entry(delta.index.unwrap_or(0)).or_default();
        if delta.id.is_some() {
            entry.id = delta.id;
        }
        if let Some(function) = delta.function {
            if function.name.is_some() {
                entry.name = function.name;
            }
            if let Some(arguments) = function.arguments {
                entry.arguments.push_str(&arguments);
            }
        }
    }

    fn flush_calls(&mut self, out: &mut VecDeque<Result<ModelChunk, ModelError>>) {
        if self.pending.is_empty() {
            return;
        }
        let calls: Vec<ModelFunctionCall> = std::mem::take(&mut self.pending)
            .into_values()
            .filter_map(|call| {
                let Some(name) = call.name.filter(|name| !name.is_empty()) else {
                    warn!("Dropping model tool call without a name");
                    return None;
                };
                let args = parse_arguments(&name, &call.arguments);
                Some(ModelFunctionCall {
                    id: call.id,
                    name,
                    args,
                })
            })
            .collect();
        if !calls.is_empty() {
            out.push_back(Ok(ModelChunk::calls(calls)));
        }
    }
}

fn parse_arguments(name: &str, raw: &str) -> Map<String, Value> {
    if raw.trim().is_empty() {
        return Map::new();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        Ok(_) | Err(_) => {
            warn!(tool = %name, "Model sent tool arguments that are not a JSON object");
            Map::new()
        }
    }
}

fn extract_error_summary(value: &Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value.get("error").and_then(|v| match v {
                Value::String(s) => Some(s.to_string()),
                _ => None,
            })
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str().map(str::to_owned))
        });

    summary.map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// Condenses an upstream error body into a single-line message.
pub fn format_api_error(error_text: &str) -> String {
    let trimmed = error_text.trim();
    if trimmed.is_empty() {
        return "API Error: <empty>".to_string();
    }

    if let Ok(json_value) = serde_json::from_str::<Value>(trimmed) {
        if let Some(summary) = extract_error_summary(&json_value).filter(|s| !s.is_empty()) {
            return format!("API Error: {summary}");
        }
        return format!("API Error: {json_value}");
    }

    let collapsed = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");
    format!("API Error: {collapsed}")
}
