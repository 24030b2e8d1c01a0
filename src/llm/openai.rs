//! OpenAI-compatible client over reqwest.

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{LlmClient, ModerationVerdict, StreamEvent};
use crate::config::LlmConfig;
use crate::messages::{ToolCallDescriptor, ToolCallFunction};

// Moderation flags violence constantly on exercise talk ("killed that
// workout"); only trust it above this score.
const VIOLENCE_SCORE_THRESHOLD: f64 = 0.8;

#[derive(Clone)]
pub struct OpenAiClient {
    api_url: String,
    api_key: Option<String>,
    model: String,
    moderation_model: String,
    structured_retries: u32,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    id: String,
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModerationResponse {
    results: Vec<ModerationResult>,
}

#[derive(Debug, Deserialize)]
struct ModerationResult {
    flagged: bool,
    categories: serde_json::Map<String, Value>,
    #[serde(default)]
    category_scores: serde_json::Map<String, Value>,
}

/// Accumulates streamed tool-call fragments by slot index until the stream
/// closes.
#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl OpenAiClient {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            moderation_model: config.moderation_model.clone(),
            structured_retries: config.structured_retries.max(1),
            client: reqwest::Client::new(),
        }
    }

    fn request(&self, url: &str, body: &Value) -> reqwest::RequestBuilder {
        let mut req = self.client.post(url).json(body);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }
        req
    }

    async fn chat(&self, body: Value) -> Result<ChatCompletionResponse> {
        let url = format!("{}/chat/completions", self.api_url);
        let response = self
            .request(&url, &body)
            .send()
            .await
            .context("Failed to send LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            bail!("LLM API returned error {}: {}", status, body);
        }

        response
            .json()
            .await
            .context("Failed to parse LLM response")
    }
}

#[async_trait::async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, messages: Vec<Value>) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": messages,
        });
        let completion = self.chat(body).await?;
        completion
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .context("No response from LLM")
    }

    async fn complete_structured(
        &self,
        messages: Vec<Value>,
        schema_name: &str,
        schema: Value,
    ) -> Result<Value> {
        let body = json!({
            "model": self.model,
            "messages": messages,
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": schema_name,
                    "schema": schema,
                    "strict": true,
                },
            },
        });

        let mut last_error = None;
        for attempt in 1..=self.structured_retries {
            match self.chat(body.clone()).await {
                Ok(completion) => {
                    let content = completion
                        .choices
                        .first()
                        .and_then(|c| c.message.content.clone())
                        .context("No response from LLM")?;
                    match serde_json::from_str(&content) {
                        Ok(value) => return Ok(value),
                        Err(e) => {
                            tracing::warn!(
                                "Structured output '{}' attempt {} was not valid JSON: {}",
                                schema_name,
                                attempt,
                                e
                            );
                            last_error = Some(anyhow::Error::new(e));
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "Structured output '{}' attempt {} failed: {}",
                        schema_name,
                        attempt,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Structured output failed")))
            .with_context(|| {
                format!(
                    "Structured output '{}' failed after {} attempts",
                    schema_name, self.structured_retries
                )
            })
    }

    async fn stream(
        &self,
        messages: Vec<Value>,
        tools: Vec<Value>,
    ) -> Result<mpsc::Receiver<Result<StreamEvent>>> {
        let url = format!("{}/chat/completions", self.api_url);
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        let response = self
            .request(&url, &body)
            .send()
            .await
            .context("Failed to send streaming LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            bail!("LLM streaming API returned error {}: {}", status, body);
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut partial_calls: Vec<PartialToolCall> = Vec::new();

            while let Some(chunk) = byte_stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx
                            .send(Err(anyhow::Error::new(e).context("LLM stream aborted")))
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);

                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data.is_empty() || data == "[DONE]" {
                        continue;
                    }

                    let parsed: StreamChunk = match serde_json::from_str(data) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            tracing::warn!("Skipping malformed stream chunk: {}", e);
                            continue;
                        }
                    };

                    let Some(choice) = parsed.choices.into_iter().next() else {
                        continue;
                    };

                    if let Some(content) = choice.delta.content {
                        if !content.is_empty()
                            && tx
                                .send(Ok(StreamEvent::TextDelta {
                                    id: parsed.id.clone(),
                                    content,
                                }))
                                .await
                                .is_err()
                        {
                            return;
                        }
                    }

                    apply_tool_call_deltas(
                        &mut partial_calls,
                        choice.delta.tool_calls.unwrap_or_default(),
                    );
                }
            }

            if !partial_calls.is_empty() {
                let _ = tx
                    .send(Ok(StreamEvent::ToolCallBatch {
                        id: Uuid::new_v4().to_string(),
                        calls: assemble_tool_calls(partial_calls),
                    }))
                    .await;
            }
        });

        Ok(rx)
    }

    async fn moderate(&self, text: &str) -> Result<ModerationVerdict> {
        let url = format!("{}/moderations", self.api_url);
        let body = json!({
            "model": self.moderation_model,
            "input": text,
        });

        let response = self
            .request(&url, &body)
            .send()
            .await
            .context("Failed to send moderation request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            bail!("Moderation API returned error {}: {}", status, body);
        }

        let parsed: ModerationResponse = response
            .json()
            .await
            .context("Failed to parse moderation response")?;
        let result = parsed
            .results
            .into_iter()
            .next()
            .context("Moderation response had no results")?;

        Ok(filter_moderation_result(result))
    }
}

/// Merges one chunk's tool-call deltas into the per-index slots. The id and
/// name arrive once; argument text arrives in fragments and is concatenated.
fn apply_tool_call_deltas(
    partial_calls: &mut Vec<PartialToolCall>,
    deltas: Vec<StreamToolCallDelta>,
) {
    for delta in deltas {
        if partial_calls.len() <= delta.index {
            partial_calls.resize_with(delta.index + 1, PartialToolCall::default);
        }
        let slot = &mut partial_calls[delta.index];
        if let Some(id) = delta.id {
            slot.id = id;
        }
        if let Some(function) = delta.function {
            if let Some(name) = function.name {
                slot.name = name;
            }
            if let Some(arguments) = function.arguments {
                slot.arguments.push_str(&arguments);
            }
        }
    }
}

fn assemble_tool_calls(partial_calls: Vec<PartialToolCall>) -> Vec<ToolCallDescriptor> {
    partial_calls
        .into_iter()
        .map(|partial| ToolCallDescriptor {
            id: partial.id,
            call_type: "function".to_string(),
            function: ToolCallFunction {
                name: partial.name,
                arguments: partial.arguments,
            },
        })
        .collect()
}

fn filter_moderation_result(result: ModerationResult) -> ModerationVerdict {
    if !result.flagged {
        return ModerationVerdict::default();
    }

    let categories: Vec<String> = result
        .categories
        .iter()
        .filter(|(_, hit)| hit.as_bool().unwrap_or(false))
        .filter(|(name, _)| {
            if !name.starts_with("violence") {
                return true;
            }
            result
                .category_scores
                .get(name.as_str())
                .and_then(Value::as_f64)
                .map(|score| score >= VIOLENCE_SCORE_THRESHOLD)
                .unwrap_or(true)
        })
        .map(|(name, _)| name.clone())
        .collect();

    ModerationVerdict {
        flagged: !categories.is_empty(),
        categories,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_from(value: Value) -> ModerationResult {
        serde_json::from_value(value).unwrap()
    }

    fn deltas_from(value: Value) -> Vec<StreamToolCallDelta> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn tool_call_fragments_accumulate_by_index() {
        let mut partial_calls = Vec::new();
        apply_tool_call_deltas(
            &mut partial_calls,
            deltas_from(json!([
                {"index": 0, "id": "c1", "function": {"name": "addWorkout", "arguments": "{\"day\":"}},
                {"index": 1, "id": "c2", "function": {"name": "deleteWorkout"}},
            ])),
        );
        apply_tool_call_deltas(
            &mut partial_calls,
            deltas_from(json!([
                {"index": 0, "function": {"arguments": "\"monday\"}"}},
                {"index": 1, "function": {"arguments": "{}"}},
            ])),
        );

        let calls = assemble_tool_calls(partial_calls);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "c1");
        assert_eq!(calls[0].function.name, "addWorkout");
        assert_eq!(calls[0].function.arguments, "{\"day\":\"monday\"}");
        assert_eq!(calls[1].id, "c2");
        assert_eq!(calls[1].function.arguments, "{}");
    }

    #[test]
    fn low_score_violence_hits_are_ignored() {
        let verdict = filter_moderation_result(result_from(json!({
            "flagged": true,
            "categories": {"violence": true, "self-harm": false},
            "category_scores": {"violence": 0.41, "self-harm": 0.01},
        })));
        assert!(!verdict.flagged);
        assert!(verdict.categories.is_empty());
    }

    #[test]
    fn high_score_violence_still_flags() {
        let verdict = filter_moderation_result(result_from(json!({
            "flagged": true,
            "categories": {"violence": true},
            "category_scores": {"violence": 0.93},
        })));
        assert!(verdict.flagged);
        assert_eq!(verdict.categories, vec!["violence".to_string()]);
    }

    #[test]
    fn non_violence_categories_pass_through() {
        let verdict = filter_moderation_result(result_from(json!({
            "flagged": true,
            "categories": {"self-harm": true, "violence": true},
            "category_scores": {"self-harm": 0.88, "violence": 0.2},
        })));
        assert!(verdict.flagged);
        assert_eq!(verdict.categories, vec!["self-harm".to_string()]);
    }
}
