//! Canonical turn records and wire shapes.
//!
//! Every turn in a conversation is recorded as an [`AnnotatedMessage`]: the
//! user's input, the assistant's reply, tool requests and tool responses,
//! plus the dialogue-state, strategy, and safety annotations attached along
//! the way. Messages are append-only once persisted; later turns add new
//! records instead of mutating old ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "message")]
    Message,
    #[serde(rename = "stream")]
    Stream,
    #[serde(rename = "visualization")]
    Visualization,
    #[serde(rename = "tool")]
    Tool,
    #[serde(rename = "acknowledgement")]
    Acknowledgement,
    #[serde(rename = "closing")]
    Closing,
    #[serde(rename = "progress")]
    Progress,
    #[serde(rename = "plan-widget")]
    PlanWidget,
}

/// One tool invocation requested by the model, in OpenAI function-call shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallDescriptor {
    pub id: String,
    #[serde(rename = "type", default = "function_call_type")]
    pub call_type: String,
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

fn function_call_type() -> String {
    "function".to_string()
}

fn default_true() -> bool {
    true
}

/// The canonical turn record.
///
/// Invariant: a `tool`-role message answering a call carries a
/// `tool_call_id` matching exactly one prior tool request, and after history
/// sanitization at most one tool message is retained per call id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotatedMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub start_state: Option<String>,
    #[serde(default)]
    pub end_state: Option<String>,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallDescriptor>>,
    /// Excluded from model context and client replay.
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub tool_call_id: Option<String>,
    /// Wire-only: tells the client whether the frontend is expected to answer
    /// the attached tool calls. Never persisted.
    #[serde(skip_serializing, default = "default_true")]
    pub should_respond_tool_call: bool,
    #[serde(default)]
    pub user_input_harmful: Option<bool>,
    #[serde(default)]
    pub user_input_harmful_categories: Option<Vec<String>>,
    #[serde(default)]
    pub model_output_harmful: Option<bool>,
    #[serde(default)]
    pub model_output_harmful_categories: Option<Vec<bool>>,
    #[serde(default)]
    pub model_output_harmful_rationales: Option<Vec<String>>,
    /// The pre-revision text, kept for audit when the output gate fired.
    #[serde(default)]
    pub original_harmful_output: Option<String>,
}

impl AnnotatedMessage {
    pub fn new(kind: MessageKind, role: Role, content: impl Into<String>) -> Self {
        Self {
            kind,
            role,
            content: content.into(),
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            start_state: None,
            end_state: None,
            strategy: None,
            tool_calls: None,
            hidden: false,
            tool_call_id: None,
            should_respond_tool_call: true,
            user_input_harmful: None,
            user_input_harmful_categories: None,
            model_output_harmful: None,
            model_output_harmful_categories: None,
            model_output_harmful_rationales: None,
            original_harmful_output: None,
        }
    }

    pub fn with_states(mut self, start: impl Into<String>, end: impl Into<String>) -> Self {
        self.start_state = Some(start.into());
        self.end_state = Some(end.into());
        self
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_tool_call_id(mut self, tool_call_id: Option<String>) -> Self {
        self.tool_call_id = tool_call_id;
        self
    }

    /// Shape pushed to the client over the WebSocket.
    pub fn to_wire(&self) -> Value {
        json!({
            "type": self.kind,
            "role": self.role,
            "content": self.content,
            "id": self.id,
            "tool_calls": self.tool_calls.clone().unwrap_or_default(),
            "should_respond_tool_call": self.should_respond_tool_call,
        })
    }

    /// Shape sent to the chat-completion API.
    pub fn to_llm(&self) -> Value {
        let mut message = json!({
            "role": self.role,
            "content": self.content,
        });
        if let Some(tool_calls) = &self.tool_calls {
            message["tool_calls"] = json!(tool_calls);
        }
        if let Some(tool_call_id) = &self.tool_call_id {
            message["tool_call_id"] = json!(tool_call_id);
        }
        message
    }

    /// Shape replayed to the client on session resume.
    ///
    /// A tool-role reply whose content is the plan payload is re-typed as a
    /// plan widget so the client renders it instead of showing raw JSON, and
    /// replayed messages never request a tool answer.
    pub fn to_replay(&self) -> Value {
        let mut msg = self.to_wire();

        if self.role == Role::Tool && is_plan_payload(&self.content) {
            msg["type"] = json!(MessageKind::PlanWidget);
            msg["role"] = json!(Role::Assistant);
        }

        msg["should_respond_tool_call"] = json!(false);
        msg
    }

    /// Converts a history into chat-completion messages, dropping hidden and
    /// visualization-only entries.
    pub fn history_to_llm(history: &[AnnotatedMessage]) -> Vec<Value> {
        history
            .iter()
            .filter(|m| !m.hidden && m.kind != MessageKind::Visualization)
            .map(AnnotatedMessage::to_llm)
            .collect()
    }
}

/// Whether a tool reply's content is the plan widget payload.
pub fn is_plan_payload(content: &str) -> bool {
    match serde_json::from_str::<Value>(content) {
        Ok(Value::Object(map)) => {
            let mut keys: Vec<&str> = map.keys().map(String::as_str).collect();
            keys.sort_unstable();
            keys == ["message", "plan", "revision_message"]
        }
        _ => false,
    }
}

/// A plain chat message received from the client.
#[derive(Debug, Clone, Deserialize)]
pub struct UserChatMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub role: Role,
    pub content: String,
    #[serde(default = "new_message_id")]
    pub id: String,
}

fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// One answered tool call, in the shape fed back to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResponsePayload {
    pub tool_call_id: String,
    pub content: String,
    pub role: String,
    pub name: String,
}

/// A batch of tool answers submitted by the client (or synthesized by the
/// coordinator on timeout).
#[derive(Debug, Clone, Deserialize)]
pub struct ToolResponseMessage {
    #[serde(default)]
    pub tool_responses: Vec<ToolResponsePayload>,
}

/// An incoming WebSocket frame, discriminated by role.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    User(UserChatMessage),
    ToolResponses(ToolResponseMessage),
}

impl ClientMessage {
    pub fn parse(data: &Value) -> anyhow::Result<Self> {
        if data.get("role").and_then(Value::as_str) == Some("user") {
            let message: UserChatMessage = serde_json::from_value(data.clone())?;
            Ok(ClientMessage::User(message))
        } else {
            let message: ToolResponseMessage = serde_json::from_value(data.clone())?;
            Ok(ClientMessage::ToolResponses(message))
        }
    }
}

/// System-level control frame (acknowledgement, progress, closing).
pub fn control_frame(kind: MessageKind, content: &str) -> Value {
    json!({
        "type": kind,
        "role": Role::System,
        "content": content,
        "id": Uuid::new_v4().to_string(),
    })
}
