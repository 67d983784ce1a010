use std::convert::Infallible;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::AppState;
use crate::mcp::error::RefreshError;
use crate::mcp::{ConnectionOutcome, EndpointDescriptor, ToolCall};
use crate::relay::encode_event;

#[derive(Serialize)]
struct Envelope<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(Envelope {
        success: true,
        data: Some(data),
        error: None,
    })
    .into_response()
}

fn ok_empty() -> Response {
    Json(Envelope::<()> {
        success: true,
        data: None,
        error: None,
    })
    .into_response()
}

fn fail(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(Envelope::<()> {
            success: false,
            data: None,
            error: Some(message.into()),
        }),
    )
        .into_response()
}

fn bad_body(rejection: JsonRejection) -> Response {
    fail(StatusCode::BAD_REQUEST, rejection.body_text())
}

/// Trimmed, non-empty value of an optional field.
fn required(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerIdBody {
    server_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolBody {
    server_id: Option<String>,
    tool_call: Option<ToolCall>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptBody {
    server_id: Option<String>,
    prompt_name: Option<String>,
    #[serde(default)]
    arguments: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceBody {
    server_id: Option<String>,
    uri: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteFunctionBody {
    server_id: Option<String>,
    function_call: Option<ToolCall>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    q: Option<String>,
    mcp_servers: Option<String>,
}

pub async fn connect(
    State(state): State<AppState>,
    body: Result<Json<EndpointDescriptor>, JsonRejection>,
) -> Response {
    let Json(descriptor) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    match state.registry.connect(descriptor).await {
        ConnectionOutcome::Connected(connection) => ok(&*connection),
        ConnectionOutcome::Failed { message, .. } => fail(StatusCode::BAD_GATEWAY, message),
    }
}

pub async fn disconnect(
    State(state): State<AppState>,
    body: Result<Json<ServerIdBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    let Some(server_id) = required(body.server_id) else {
        return fail(StatusCode::BAD_REQUEST, "serverId is required");
    };
    state.registry.disconnect(&server_id).await;
    ok_empty()
}

pub async fn status_list(State(state): State<AppState>) -> Response {
    let ids = state.registry.list_ids().await;
    ok(json!({"connectedServerIds": ids, "count": ids.len()}))
}

pub async fn status_one(
    State(state): State<AppState>,
    body: Result<Json<ServerIdBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    let Some(server_id) = required(body.server_id) else {
        return fail(StatusCode::BAD_REQUEST, "serverId is required");
    };
    match state.registry.refresh_catalog(&server_id).await {
        Ok(connection) => ok(json!({
            "serverId": server_id,
            "isConnected": true,
            "serverInfo": &*connection,
        })),
        Err(err) => {
            let mut data = json!({
                "serverId": server_id,
                "isConnected": state.registry.is_connected(&server_id).await,
                "serverInfo": null,
            });
            if matches!(err, RefreshError::Unavailable { .. }) {
                data["error"] = json!(err.to_string());
            }
            ok(data)
        }
    }
}

pub async fn call_tool(
    State(state): State<AppState>,
    body: Result<Json<ToolBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    let (Some(server_id), Some(tool_call)) = (required(body.server_id), body.tool_call) else {
        return fail(StatusCode::BAD_REQUEST, "serverId and toolCall are required");
    };
    match state.invoker.call_tool(&server_id, &tool_call).await {
        Ok(result) => ok(result),
        Err(err) => fail(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

pub async fn get_prompt(
    State(state): State<AppState>,
    body: Result<Json<PromptBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    let (Some(server_id), Some(prompt_name)) =
        (required(body.server_id), required(body.prompt_name))
    else {
        return fail(StatusCode::BAD_REQUEST, "serverId and promptName are required");
    };
    let arguments = body.arguments.unwrap_or_default();
    match state
        .invoker
        .get_prompt(&server_id, &prompt_name, &arguments)
        .await
    {
        Ok(result) => ok(result),
        Err(err) => fail(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

pub async fn read_resource(
    State(state): State<AppState>,
    body: Result<Json<ResourceBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    let (Some(server_id), Some(uri)) = (required(body.server_id), required(body.uri)) else {
        return fail(StatusCode::BAD_REQUEST, "serverId and uri are required");
    };
    match state.invoker.read_resource(&server_id, &uri).await {
        Ok(result) => ok(result),
        Err(err) => fail(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn enabled_ids(raw: Option<&str>) -> Vec<String> {
    raw.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// Streams relay events as `text/event-stream`. Dropping the response
/// cancels the relay.
pub async fn chat_stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let prompt = query.q.unwrap_or_default();
    let enabled = enabled_ids(query.mcp_servers.as_deref());
    debug!(servers = ?enabled, "Chat stream requested");

    let cancel = CancellationToken::new();
    let events = state.relay.spawn(prompt, enabled, cancel.clone());
    let guard = cancel.drop_guard();

    let body = stream::unfold((events, guard), |(mut events, guard)| async move {
        let event = events.recv().await?;
        Some((Ok::<_, Infallible>(encode_event(&event)), (events, guard)))
    });

    (
        [
            (header::CONTENT_TYPE, "text/event-stream; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache, no-transform"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Body::from_stream(body),
    )
        .into_response()
}

pub async fn execute_function(
    State(state): State<AppState>,
    body: Result<Json<ExecuteFunctionBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    let (Some(server_id), Some(call)) = (required(body.server_id), body.function_call) else {
        return fail(
            StatusCode::BAD_REQUEST,
            "serverId and functionCall are required",
        );
    };
    match state.relay.execute_function(&server_id, &call).await {
        Ok(result) => ok(result),
        Err(err) => {
            warn!(server_id = %server_id, tool = %call.name, error = %err, "Function execution failed");
            fail(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

/// Waits for the result of a call the relay dispatched. A delivered result
/// is released, so each call id is served once.
pub async fn tool_result(State(state): State<AppState>, Path(call_id): Path<String>) -> Response {
    let results = state.relay.results();
    if !results.is_known(&call_id) {
        return fail(StatusCode::NOT_FOUND, format!("Unknown call id `{call_id}`"));
    }
    match results.take(&call_id).await {
        Some(result) => ok(result),
        None => fail(
            StatusCode::GATEWAY_TIMEOUT,
            format!("Timed out waiting for the result of `{call_id}`"),
        ),
    }
}
