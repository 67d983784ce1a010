//! The model backend seam: anything that can stream a generation for a
//! prompt, optionally with tool declarations.

use crate::api::ChatToolDefinition;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::{Map, Value};
use thiserror::Error;

use super::events::StreamErrorCode;

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    /// `None` when no declarations were assembled; never an empty list.
    pub tools: Option<Vec<ChatToolDefinition>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelFunctionCall {
    pub id: Option<String>,
    pub name: String,
    pub args: Map<String, Value>,
}

/// One increment of model output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelChunk {
    pub text: Option<String>,
    pub function_calls: Vec<ModelFunctionCall>,
}

impl ModelChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            text: Some(delta.into()),
            function_calls: Vec::new(),
        }
    }

    pub fn calls(function_calls: Vec<ModelFunctionCall>) -> Self {
        Self {
            text: None,
            function_calls,
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ModelError {
    pub status: Option<u16>,
    pub message: String,
}

impl ModelError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn code(&self) -> StreamErrorCode {
        StreamErrorCode::from_status(self.status)
    }
}

pub type ModelStream = BoxStream<'static, Result<ModelChunk, ModelError>>;

#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn generate_stream(&self, request: GenerateRequest) -> Result<ModelStream, ModelError>;
}
