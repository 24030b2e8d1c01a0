//! Tool-call coordination.
//!
//! Backend tools execute in-process; frontend tools are forwarded to the
//! client and answered asynchronously over the WebSocket. The coordinator
//! tracks per-user active (awaiting answer) and finished (result available)
//! calls under two separate locks, guarantees exactly one result per call id,
//! and synthesizes an error result when the client never answers.

mod backend;

pub use backend::{
    BackendOutcome, BackendToolRunner, ADD_WORKOUT, DELETE_WORKOUT, GENERATE_PLAN,
    SHOW_PLAN_WIDGET,
};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::messages::{AnnotatedMessage, ToolCallDescriptor, ToolResponsePayload};
use crate::pipeline::ChatMode;
use crate::plan::VALID_WORKOUT_TYPES;
use crate::transport::Transport;

pub const QUERY_HEALTH_DATA: &str = "query_health_data";

pub const TOOL_TIMEOUT_MESSAGE: &str = "Timeout occurred while waiting for tool responses.";

pub fn is_frontend_tool(name: &str) -> bool {
    name == QUERY_HEALTH_DATA
}

pub fn error_tool_response(call_id: &str, content: &str) -> ToolResponsePayload {
    ToolResponsePayload {
        tool_call_id: call_id.to_string(),
        content: content.to_string(),
        role: "tool".to_string(),
        name: "error".to_string(),
    }
}

/// Tool definitions advertised to the model. Open chat cannot regenerate the
/// weekly plan; that is reserved for onboarding and check-in.
pub fn available_tools(mode: ChatMode) -> Vec<Value> {
    let mut tools = vec![
        function_def(
            GENERATE_PLAN,
            "Generate and save the user's weekly activity plan from the goals agreed in this conversation.",
            json!({"type": "object", "properties": {}, "required": []}),
        ),
        function_def(
            SHOW_PLAN_WIDGET,
            "Show the user their current weekly plan.",
            json!({"type": "object", "properties": {}, "required": []}),
        ),
        function_def(
            ADD_WORKOUT,
            "Add one workout to the user's active weekly plan.",
            json!({
                "type": "object",
                "properties": {
                    "day": {"type": "string"},
                    "type": {"type": "string", "enum": VALID_WORKOUT_TYPES},
                    "time_start": {"type": "string", "description": "24h clock, HH:MM"},
                    "duration_min": {"type": "integer"},
                    "intensity": {"type": "string", "enum": ["low", "moderate", "high"]},
                    "location": {"type": "string"},
                },
                "required": ["day", "type", "time_start", "duration_min"],
            }),
        ),
        function_def(
            DELETE_WORKOUT,
            "Remove one workout from the user's active weekly plan.",
            json!({
                "type": "object",
                "properties": {
                    "day": {"type": "string"},
                    "type": {"type": "string"},
                    "time_start": {"type": "string"},
                },
                "required": ["day", "type"],
            }),
        ),
        function_def(
            QUERY_HEALTH_DATA,
            "Query the user's device health data, such as step counts or recorded workouts.",
            json!({
                "type": "object",
                "properties": {
                    "sample_type": {
                        "type": "string",
                        "enum": ["steps", "workouts", "heart_rate", "active_energy"],
                    },
                    "start_date": {"type": "string"},
                    "end_date": {"type": "string"},
                },
                "required": ["sample_type", "start_date", "end_date"],
            }),
        ),
    ];

    if mode == ChatMode::AtWill {
        tools.retain(|tool| tool["function"]["name"] != GENERATE_PLAN);
    }
    tools
}

fn function_def(name: &str, description: &str, parameters: Value) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": name,
            "description": description,
            "parameters": parameters,
        },
    })
}

struct ActiveCall {
    answered_tx: oneshot::Sender<()>,
    wait_task: JoinHandle<()>,
}

pub struct ToolCoordinator {
    // Disjoint locks: answers touch both briefly, never nested the other way.
    active: Mutex<HashMap<String, HashMap<String, ActiveCall>>>,
    finished: Mutex<HashMap<String, HashMap<String, ToolResponsePayload>>>,
    timeout: Duration,
    timeout_tx: mpsc::Sender<String>,
}

impl ToolCoordinator {
    /// Returns the coordinator and the channel of timeout notices; each
    /// notice names a uid whose finished results should be flushed through
    /// the session loop.
    pub fn new(timeout: Duration) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (timeout_tx, timeout_rx) = mpsc::channel(64);
        (
            Arc::new(Self {
                active: Mutex::new(HashMap::new()),
                finished: Mutex::new(HashMap::new()),
                timeout,
                timeout_tx,
            }),
            timeout_rx,
        )
    }

    /// Executes a tool-request batch. Backend calls run here, in order, each
    /// bounded by the tool timeout; frontend calls are registered as active
    /// and returned for forwarding to the client.
    ///
    /// UI refresh rules: plan generation and display push the plan widget
    /// immediately; of the workout mutations only the last successful one
    /// pushes, after the whole batch ran.
    pub async fn process_tool_calls(
        self: &Arc<Self>,
        uid: &str,
        calls: &[ToolCallDescriptor],
        history: &[AnnotatedMessage],
        runner: &BackendToolRunner,
        transport: &dyn Transport,
    ) -> Result<Vec<ToolCallDescriptor>> {
        let mut frontend = Vec::new();
        let mut deferred_widget: Option<Value> = None;

        for call in calls {
            let name = call.function.name.as_str();
            if is_frontend_tool(name) {
                self.dispatch_frontend(uid, call).await;
                frontend.push(call.clone());
            } else if BackendToolRunner::handles(name) {
                let outcome =
                    match tokio::time::timeout(self.timeout, runner.run(uid, call, history)).await
                    {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            tracing::warn!("Backend tool {} timed out for {}", name, uid);
                            self.record_finished(
                                uid,
                                error_tool_response(&call.id, TOOL_TIMEOUT_MESSAGE),
                            )
                            .await;
                            continue;
                        }
                    };
                if outcome.is_mutation {
                    if outcome.succeeded && outcome.widget.is_some() {
                        deferred_widget = outcome.widget.clone();
                    }
                } else if let Some(widget) = &outcome.widget {
                    transport.send(uid, widget.clone()).await?;
                }
                self.record_finished(uid, outcome.response).await;
            } else {
                tracing::warn!("Model requested unknown tool '{}'", name);
                self.record_finished(
                    uid,
                    error_tool_response(&call.id, &format!("Error: Tool '{}' not found.", name)),
                )
                .await;
            }
        }

        if let Some(widget) = deferred_widget {
            transport.send(uid, widget).await?;
        }
        Ok(frontend)
    }

    /// Matches client answers against active calls, waits out the remaining
    /// active calls (each resolves by a late answer or by its own timeout),
    /// then drains and returns every finished result for the user. The maps
    /// are left empty for the uid.
    pub async fn finish_tool_responses(
        self: &Arc<Self>,
        uid: &str,
        responses: Vec<ToolResponsePayload>,
    ) -> Vec<ToolResponsePayload> {
        let mut answered_waits = Vec::new();
        {
            let mut active = self.active.lock().await;
            let mut finished = self.finished.lock().await;
            for response in responses {
                let call = active
                    .get_mut(uid)
                    .and_then(|calls| calls.remove(&response.tool_call_id));
                match call {
                    Some(call) => {
                        finished
                            .entry(uid.to_string())
                            .or_default()
                            .insert(response.tool_call_id.clone(), response);
                        let _ = call.answered_tx.send(());
                        answered_waits.push(call.wait_task);
                    }
                    None => {
                        tracing::warn!(
                            "Dropping stale tool answer {} for {}",
                            response.tool_call_id,
                            uid
                        );
                    }
                }
            }
        }
        for task in answered_waits {
            let _ = task.await;
        }

        let remaining: Vec<ActiveCall> = {
            let mut active = self.active.lock().await;
            active
                .remove(uid)
                .map(|calls| calls.into_values().collect())
                .unwrap_or_default()
        };
        for call in remaining {
            // Bounded: the wait task times out on its own.
            let _ = call.wait_task.await;
        }

        let mut finished = self.finished.lock().await;
        finished
            .remove(uid)
            .map(|calls| calls.into_values().collect())
            .unwrap_or_default()
    }

    pub async fn has_active_calls(&self, uid: &str) -> bool {
        let active = self.active.lock().await;
        active.get(uid).map(|calls| !calls.is_empty()).unwrap_or(false)
    }

    async fn dispatch_frontend(self: &Arc<Self>, uid: &str, call: &ToolCallDescriptor) {
        let (answered_tx, answered_rx) = oneshot::channel::<()>();
        let coordinator = Arc::clone(self);
        let wait_uid = uid.to_string();
        let wait_call_id = call.id.clone();
        let wait_task = tokio::spawn(async move {
            // An answer (or a replaced registration) resolves the oneshot;
            // otherwise the timeout synthesizes the result.
            if tokio::time::timeout(coordinator.timeout, answered_rx)
                .await
                .is_err()
            {
                tracing::warn!("Tool call {} for {} timed out", wait_call_id, wait_uid);
                {
                    let mut active = coordinator.active.lock().await;
                    if let Some(calls) = active.get_mut(&wait_uid) {
                        calls.remove(&wait_call_id);
                    }
                }
                {
                    let mut finished = coordinator.finished.lock().await;
                    finished
                        .entry(wait_uid.clone())
                        .or_default()
                        .entry(wait_call_id.clone())
                        .or_insert_with(|| {
                            error_tool_response(&wait_call_id, TOOL_TIMEOUT_MESSAGE)
                        });
                }
                let _ = coordinator.timeout_tx.send(wait_uid).await;
            }
        });

        let mut active = self.active.lock().await;
        let calls = active.entry(uid.to_string()).or_default();
        if let Some(previous) = calls.insert(
            call.id.clone(),
            ActiveCall {
                answered_tx,
                wait_task,
            },
        ) {
            // A call id must never be active twice; keep the newest wait.
            tracing::warn!("Replacing duplicate active tool call {}", call.id);
            previous.wait_task.abort();
        }
    }

    async fn record_finished(&self, uid: &str, response: ToolResponsePayload) {
        let mut finished = self.finished.lock().await;
        finished
            .entry(uid.to_string())
            .or_default()
            .insert(response.tool_call_id.clone(), response);
    }
}
