//! LLM client seam.
//!
//! Everything that talks to the model goes through [`LlmClient`] so the
//! pipeline, classifiers, and summarizer can be exercised against fakes.

mod openai;

pub use openai::OpenAiClient;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::messages::ToolCallDescriptor;

/// One event from a streamed completion. Text deltas carry the provider's
/// chunk id so the client can group frames belonging to one message.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta { id: String, content: String },
    ToolCallBatch { id: String, calls: Vec<ToolCallDescriptor> },
}

/// Moderation verdict for a piece of user input.
#[derive(Debug, Clone, Default)]
pub struct ModerationVerdict {
    pub flagged: bool,
    pub categories: Vec<String>,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Single buffered completion. Part of the client surface even though
    /// the service paths go through `complete_structured` and `stream`.
    async fn complete(&self, messages: Vec<Value>) -> Result<String>;

    /// JSON-schema constrained completion, returned as parsed JSON.
    /// Implementations retry transient failures a bounded number of times.
    async fn complete_structured(
        &self,
        messages: Vec<Value>,
        schema_name: &str,
        schema: Value,
    ) -> Result<Value>;

    /// Streamed completion. `tools` is the advertised tool list (empty for
    /// plain text generation). Events arrive on the returned channel; the
    /// channel closing marks the end of the stream.
    async fn stream(
        &self,
        messages: Vec<Value>,
        tools: Vec<Value>,
    ) -> Result<mpsc::Receiver<Result<StreamEvent>>>;

    /// Input moderation.
    async fn moderate(&self, text: &str) -> Result<ModerationVerdict>;
}

/// Typed wrapper over [`LlmClient::complete_structured`].
pub async fn structured<T: DeserializeOwned>(
    client: &dyn LlmClient,
    messages: Vec<Value>,
    schema_name: &str,
    schema: Value,
) -> Result<T> {
    let value = client
        .complete_structured(messages, schema_name, schema)
        .await?;
    serde_json::from_value(value)
        .with_context(|| format!("Structured output '{}' had unexpected shape", schema_name))
}

/// Builds a strict object schema with every property required, the shape the
/// structured-output API expects.
pub fn object_schema(properties: Value) -> Value {
    let required: Vec<String> = properties
        .as_object()
        .map(|props| props.keys().cloned().collect())
        .unwrap_or_default();
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

pub fn system_message(content: impl Into<String>) -> Value {
    json!({"role": "system", "content": content.into()})
}

pub fn user_message(content: impl Into<String>) -> Value {
    json!({"role": "user", "content": content.into()})
}

pub fn assistant_message(content: impl Into<String>) -> Value {
    json!({"role": "assistant", "content": content.into()})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_schema_requires_every_property() {
        let schema = object_schema(json!({
            "rationale": {"type": "string"},
            "harmful": {"type": "boolean"},
        }));
        let required = schema["required"].as_array().unwrap();
        assert_eq!(required.len(), 2);
        assert!(required.contains(&json!("rationale")));
        assert_eq!(schema["additionalProperties"], json!(false));
    }
}
