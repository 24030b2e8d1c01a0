//! Backend tool execution.
//!
//! Backend tools run inside the service against the stored plan. Failures
//! never propagate as errors: the model gets an `Error: ...` tool result and
//! decides how to tell the user.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use serde_json::Value;

use crate::memory::Summarizer;
use crate::messages::{AnnotatedMessage, MessageKind, Role, ToolCallDescriptor, ToolResponsePayload};
use crate::plan::{self, AddWorkoutArgs, DeleteWorkoutArgs, PlanGenerator, PlanService};
use crate::store::ChatStore;

pub const GENERATE_PLAN: &str = "generate_plan";
pub const SHOW_PLAN_WIDGET: &str = "plan-widget";
pub const ADD_WORKOUT: &str = "addWorkout";
pub const DELETE_WORKOUT: &str = "deleteWorkout";

/// Result of one backend tool run, with the UI-refresh metadata the
/// coordinator needs to apply the widget push rules.
#[derive(Debug, Clone)]
pub struct BackendOutcome {
    pub response: ToolResponsePayload,
    /// Wire frame for the plan widget, when the run produced one.
    pub widget: Option<Value>,
    /// Workout mutations defer their widget push to the end of the batch;
    /// plan generation and display push eagerly.
    pub is_mutation: bool,
    pub succeeded: bool,
}

pub struct BackendToolRunner {
    store: Arc<ChatStore>,
    plans: Arc<PlanService>,
    generator: Arc<dyn PlanGenerator>,
    memory: Arc<Summarizer>,
}

impl BackendToolRunner {
    pub fn new(
        store: Arc<ChatStore>,
        plans: Arc<PlanService>,
        generator: Arc<dyn PlanGenerator>,
        memory: Arc<Summarizer>,
    ) -> Self {
        Self {
            store,
            plans,
            generator,
            memory,
        }
    }

    pub fn handles(name: &str) -> bool {
        matches!(
            name,
            GENERATE_PLAN | SHOW_PLAN_WIDGET | ADD_WORKOUT | DELETE_WORKOUT
        )
    }

    pub async fn run(
        &self,
        uid: &str,
        call: &ToolCallDescriptor,
        history: &[AnnotatedMessage],
    ) -> BackendOutcome {
        let name = call.function.name.as_str();
        let result = match name {
            GENERATE_PLAN => self.generate_plan(uid, history).await,
            SHOW_PLAN_WIDGET => self.show_plan(uid),
            ADD_WORKOUT => self.add_workout(uid, &call.function.arguments),
            DELETE_WORKOUT => self.delete_workout(uid, &call.function.arguments),
            other => Err(anyhow::anyhow!("Tool '{}' not found", other)),
        };

        match result {
            Ok((content, widget)) => BackendOutcome {
                response: tool_response(&call.id, name, content),
                widget,
                is_mutation: matches!(name, ADD_WORKOUT | DELETE_WORKOUT),
                succeeded: true,
            },
            Err(e) => {
                tracing::warn!("Backend tool {} failed for {}: {:#}", name, uid, e);
                BackendOutcome {
                    response: tool_response(&call.id, name, format!("Error: {:#}", e)),
                    widget: None,
                    is_mutation: matches!(name, ADD_WORKOUT | DELETE_WORKOUT),
                    succeeded: false,
                }
            }
        }
    }

    async fn generate_plan(
        &self,
        uid: &str,
        history: &[AnnotatedMessage],
    ) -> Result<(String, Option<Value>)> {
        let now = Utc::now();
        let tz = self.store.user_timezone(uid)?;
        let start_date = now.with_timezone(&tz).date_naive();
        let end_date = start_date + Duration::days(6);

        let memory = self.memory.retrieve(uid)?;
        let (plan, message) = self
            .generator
            .generate_plan(uid, history, &memory, start_date, end_date)
            .await?;

        let Some(plan) = plan else {
            // No agreed goal yet; the model relays what is missing.
            return Ok((message, None));
        };

        let chat_state = self.store.user_chat_state(uid)?;
        let record = self.plans.save_generated(
            uid, &chat_state, plan, "", start_date, end_date, now,
        )?;
        let payload = plan::widget_payload(&record, &message);
        let widget = widget_frame(&payload);
        Ok((payload.to_string(), Some(widget)))
    }

    fn show_plan(&self, uid: &str) -> Result<(String, Option<Value>)> {
        let now = Utc::now();
        let tz = self.store.user_timezone(uid)?;
        let record = self
            .plans
            .active_plan(uid, now, &tz)?
            .context("No active weekly plan to show")?;
        let payload = plan::widget_payload(&record, "Here is your current plan.");
        let widget = widget_frame(&payload);
        Ok((payload.to_string(), Some(widget)))
    }

    fn add_workout(&self, uid: &str, arguments: &str) -> Result<(String, Option<Value>)> {
        let args: AddWorkoutArgs =
            serde_json::from_str(arguments).context("Invalid addWorkout arguments")?;
        let now = Utc::now();
        let tz = self.store.user_timezone(uid)?;
        let (record, message) = self.plans.add_workout(uid, args, now, &tz)?;
        let payload = plan::widget_payload(&record, &message);
        let widget = widget_frame(&payload);
        Ok((payload.to_string(), Some(widget)))
    }

    fn delete_workout(&self, uid: &str, arguments: &str) -> Result<(String, Option<Value>)> {
        let args: DeleteWorkoutArgs =
            serde_json::from_str(arguments).context("Invalid deleteWorkout arguments")?;
        let now = Utc::now();
        let tz = self.store.user_timezone(uid)?;
        let (record, message) = self.plans.delete_workout(uid, args, now, &tz)?;
        let payload = plan::widget_payload(&record, &message);
        let widget = widget_frame(&payload);
        Ok((payload.to_string(), Some(widget)))
    }
}

fn tool_response(call_id: &str, name: &str, content: String) -> ToolResponsePayload {
    ToolResponsePayload {
        tool_call_id: call_id.to_string(),
        content,
        role: "tool".to_string(),
        name: name.to_string(),
    }
}

/// Plan widget frames are pushed straight to the client, never stored; on
/// replay they are rebuilt from the stored tool reply.
fn widget_frame(payload: &Value) -> Value {
    AnnotatedMessage::new(MessageKind::PlanWidget, Role::Assistant, payload.to_string()).to_wire()
}
