//! Session lifecycle and turn sequencing.
//!
//! The [`SessionManager`] owns one [`SessionEntry`] per connected user: the
//! resolved session id, the in-memory history, a mode-specific pipeline, and
//! a turn gate serializing turns so a second client frame cannot interleave
//! with a running one. It also implements [`ResponseSink`], so everything the
//! pipeline produces flows back through here for transport, persistence, and
//! tool-call follow-up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

use crate::dialogue::INITIAL_STATE;
use crate::llm::LlmClient;
use crate::memory::Summarizer;
use crate::notify::NotificationDispatcher;
use crate::prompts;
use crate::messages::{
    control_frame, is_plan_payload, AnnotatedMessage, ClientMessage, MessageKind, Role,
    ToolCallDescriptor, ToolResponsePayload,
};
use crate::pipeline::{
    ChatMode, GenEvent, IncomingTurn, MemoryPolicy, ModeProfile, ResponseSink, TurnPipeline,
};
use crate::plan::PlanService;
use crate::scheduler::{JobKey, JobScheduler};
use crate::store::ChatStore;
use crate::tools::{BackendToolRunner, ToolCoordinator};
use crate::transport::Transport;

struct SessionEntry {
    session_id: String,
    mode: ChatMode,
    history: Vec<AnnotatedMessage>,
    pipeline: Arc<TurnPipeline>,
    turn_gate: Arc<Mutex<()>>,
}

pub struct SessionManager {
    store: Arc<ChatStore>,
    transport: Arc<dyn Transport>,
    llm: Arc<dyn LlmClient>,
    runner: Arc<BackendToolRunner>,
    coordinator: Arc<ToolCoordinator>,
    scheduler: Arc<JobScheduler>,
    summarizer: Arc<Summarizer>,
    plans: Arc<PlanService>,
    notifier: Arc<dyn NotificationDispatcher>,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    // Backend tool results awaiting their follow-up turn, per uid.
    followups: std::sync::Mutex<HashMap<String, Vec<ToolResponsePayload>>>,
    summary_delay: Duration,
    check_in_delay: Duration,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<ChatStore>,
        transport: Arc<dyn Transport>,
        llm: Arc<dyn LlmClient>,
        runner: Arc<BackendToolRunner>,
        coordinator: Arc<ToolCoordinator>,
        scheduler: Arc<JobScheduler>,
        summarizer: Arc<Summarizer>,
        plans: Arc<PlanService>,
        notifier: Arc<dyn NotificationDispatcher>,
        summary_delay: Duration,
        check_in_delay: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            llm,
            runner,
            coordinator,
            scheduler,
            summarizer,
            plans,
            notifier,
            sessions: Mutex::new(HashMap::new()),
            followups: std::sync::Mutex::new(HashMap::new()),
            summary_delay,
            check_in_delay,
        }
    }

    /// Handles a fresh connection: resolves the session, replays its history,
    /// then lets the pipeline open the conversation (greeting, pending
    /// opener, or reprocessing a dangling turn).
    pub async fn start_conversation(&self, uid: &str, mode: ChatMode) -> Result<()> {
        self.store.ensure_user(uid)?;
        self.transport
            .send(uid, control_frame(MessageKind::Acknowledgement, ""))
            .await?;

        let now = Utc::now();
        let tz = self.store.user_timezone(uid)?;
        let session_id = self.store.resolve_session(uid, mode.as_str(), now, &tz)?;
        let history = sanitize_history(self.store.load_history(uid, &session_id)?);
        tracing::info!(
            "Opening {} session {} for {} ({} messages)",
            mode.as_str(),
            session_id,
            uid,
            history.len()
        );

        for frame in replay_frames(&history) {
            self.transport.send(uid, frame).await?;
        }

        let profile = ModeProfile::for_mode(mode)?;
        if profile.dialogue.is_some() {
            let current = history
                .iter()
                .rev()
                .filter(|m| m.role == Role::Assistant)
                .find_map(|m| m.end_state.clone())
                .unwrap_or_else(|| INITIAL_STATE.to_string());
            self.transport
                .send(uid, control_frame(MessageKind::Progress, &current))
                .await?;
        }

        let pipeline = Arc::new(TurnPipeline::new(
            profile,
            Arc::clone(&self.llm),
            Arc::clone(&self.plans),
            Arc::clone(&self.summarizer),
            Arc::clone(&self.store),
        ));
        let turn_gate = Arc::new(Mutex::new(()));
        {
            let mut sessions = self.sessions.lock().await;
            sessions.insert(
                uid.to_string(),
                SessionEntry {
                    session_id,
                    mode,
                    history: history.clone(),
                    pipeline: Arc::clone(&pipeline),
                    turn_gate: Arc::clone(&turn_gate),
                },
            );
        }

        let result = {
            let _turn = turn_gate.lock().await;
            match pipeline.start_conversation(uid, history, self).await {
                Ok(()) => self.drain_followups(uid, &pipeline).await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = &result {
            tracing::error!("Opening turn failed for {}: {:#}", uid, e);
        }
        self.transport
            .send(uid, control_frame(MessageKind::Closing, ""))
            .await?;
        result
    }

    /// Handles one client frame: a user message runs a turn directly; a tool
    /// answer batch is reconciled by the coordinator and runs a turn once
    /// every outstanding call has a result.
    pub async fn process_client_message(&self, uid: &str, message: ClientMessage) -> Result<()> {
        let (pipeline, turn_gate) = self.session_handles(uid).await?;
        let _turn = turn_gate.lock().await;
        self.transport
            .send(uid, control_frame(MessageKind::Acknowledgement, ""))
            .await?;

        let result = match message {
            ClientMessage::User(user) => {
                self.run_turn(uid, &pipeline, IncomingTurn::User(user), true)
                    .await
            }
            ClientMessage::ToolResponses(batch) => {
                let finished = self
                    .coordinator
                    .finish_tool_responses(uid, batch.tool_responses)
                    .await;
                if finished.is_empty() {
                    Ok(())
                } else {
                    self.run_turn(uid, &pipeline, IncomingTurn::ToolResponses(finished), true)
                        .await
                }
            }
        };
        if let Err(e) = &result {
            tracing::error!("Turn failed for {}: {:#}", uid, e);
        }
        self.transport
            .send(uid, control_frame(MessageKind::Closing, ""))
            .await?;
        result
    }

    /// Flushes results synthesized by the tool-call timeout so the model can
    /// respond to them.
    pub async fn process_tool_timeout(&self, uid: &str) -> Result<()> {
        let Ok((pipeline, turn_gate)) = self.session_handles(uid).await else {
            return Ok(());
        };
        let _turn = turn_gate.lock().await;
        let finished = self.coordinator.finish_tool_responses(uid, Vec::new()).await;
        if finished.is_empty() {
            return Ok(());
        }
        self.transport
            .send(uid, control_frame(MessageKind::Acknowledgement, ""))
            .await?;
        let result = self
            .run_turn(uid, &pipeline, IncomingTurn::ToolResponses(finished), true)
            .await;
        if let Err(e) = &result {
            tracing::error!("Timeout turn failed for {}: {:#}", uid, e);
        }
        self.transport
            .send(uid, control_frame(MessageKind::Closing, ""))
            .await?;
        result
    }

    pub async fn end_session(&self, uid: &str) {
        let mut sessions = self.sessions.lock().await;
        if sessions.remove(uid).is_some() {
            tracing::info!("Closed session state for {}", uid);
        }
    }

    async fn session_handles(&self, uid: &str) -> Result<(Arc<TurnPipeline>, Arc<Mutex<()>>)> {
        let sessions = self.sessions.lock().await;
        let entry = sessions
            .get(uid)
            .with_context(|| format!("No open session for {}", uid))?;
        Ok((Arc::clone(&entry.pipeline), Arc::clone(&entry.turn_gate)))
    }

    async fn run_turn(
        &self,
        uid: &str,
        pipeline: &TurnPipeline,
        turn: IncomingTurn,
        store_incoming: bool,
    ) -> Result<()> {
        let history = self.history_snapshot(uid).await?;
        pipeline
            .process_message(uid, turn, history, self, store_incoming)
            .await?;
        self.drain_followups(uid, pipeline).await
    }

    /// Backend tool results queued during emission each get their own
    /// pipeline turn, until the model stops calling tools.
    async fn drain_followups(&self, uid: &str, pipeline: &TurnPipeline) -> Result<()> {
        while let Some(responses) = self.take_followup(uid) {
            let history = self.history_snapshot(uid).await?;
            pipeline
                .process_message(
                    uid,
                    IncomingTurn::ToolResponses(responses),
                    history,
                    self,
                    true,
                )
                .await?;
        }
        Ok(())
    }

    async fn history_snapshot(&self, uid: &str) -> Result<Vec<AnnotatedMessage>> {
        let sessions = self.sessions.lock().await;
        let entry = sessions
            .get(uid)
            .with_context(|| format!("No open session for {}", uid))?;
        Ok(entry.history.clone())
    }

    async fn store_message(&self, uid: &str, message: &AnnotatedMessage) -> Result<()> {
        let (session_id, mode, policy) = {
            let mut sessions = self.sessions.lock().await;
            let entry = sessions
                .get_mut(uid)
                .with_context(|| format!("No open session for {}", uid))?;
            self.store
                .append_message(uid, &entry.session_id, message)?;
            entry.history.push(message.clone());
            (
                entry.session_id.clone(),
                entry.mode,
                entry.pipeline.memory_policy(),
            )
        };
        self.apply_memory_policy(uid, &session_id, mode, policy, message);
        Ok(())
    }

    fn apply_memory_policy(
        &self,
        uid: &str,
        session_id: &str,
        mode: ChatMode,
        policy: MemoryPolicy,
        message: &AnnotatedMessage,
    ) {
        match policy {
            MemoryPolicy::Debounced => {
                self.schedule_summary(uid, session_id);
            }
            MemoryPolicy::OnGoodbye => {
                let reached_goodbye = message.role == Role::Assistant
                    && message.end_state.as_deref() == Some("goodbye");
                if !reached_goodbye {
                    return;
                }
                self.schedule_summary(uid, session_id);
                if mode == ChatMode::Onboarding {
                    self.schedule_check_in_advance(uid);
                }
            }
        }
    }

    fn schedule_summary(&self, uid: &str, session_id: &str) {
        let key = JobKey::Summary {
            uid: uid.to_string(),
            session_id: session_id.to_string(),
        };
        let store = Arc::clone(&self.store);
        let summarizer = Arc::clone(&self.summarizer);
        let uid = uid.to_string();
        let session_id = session_id.to_string();
        self.scheduler.schedule_in(key, self.summary_delay, async move {
            let history = match store.load_history(&uid, &session_id) {
                Ok(history) => history,
                Err(e) => {
                    tracing::error!("Summary job could not load {}: {:#}", session_id, e);
                    return;
                }
            };
            if let Err(e) = summarizer.save_summary(&uid, &session_id, &history).await {
                tracing::error!("Summary job failed for {}: {:#}", uid, e);
            }
        });
    }

    /// A finished onboarding graduates the user to check-in mode after a
    /// day, so the next conversation opens with a plan review.
    fn schedule_check_in_advance(&self, uid: &str) {
        let key = JobKey::CheckInAdvance {
            uid: uid.to_string(),
        };
        let store = Arc::clone(&self.store);
        let notifier = Arc::clone(&self.notifier);
        let uid = uid.to_string();
        self.scheduler
            .schedule_in(key, self.check_in_delay, async move {
                if let Err(e) = store.set_user_chat_state(&uid, "check_in") {
                    tracing::error!("Failed to advance {} to check-in: {:#}", uid, e);
                    return;
                }
                tracing::info!("Advanced {} to check-in", uid);
                if let Err(e) = notifier.notify(&uid, prompts::CHECK_IN_INVITE).await {
                    tracing::error!("Failed to queue check-in invite for {}: {:#}", uid, e);
                }
            });
    }

    fn queue_followup(&self, uid: &str, responses: Vec<ToolResponsePayload>) {
        let mut followups = self.followups.lock().unwrap_or_else(|e| e.into_inner());
        followups.insert(uid.to_string(), responses);
    }

    fn take_followup(&self, uid: &str) -> Option<Vec<ToolResponsePayload>> {
        let mut followups = self.followups.lock().unwrap_or_else(|e| e.into_inner());
        followups.remove(uid)
    }
}

#[async_trait]
impl ResponseSink for SessionManager {
    async fn emit(&self, uid: &str, message: AnnotatedMessage, store: bool) -> Result<()> {
        match message.role {
            // The client already renders its own input; tool results reach
            // it only through the model's next reply or a widget frame.
            Role::User | Role::Tool => {}
            Role::System => {
                self.transport
                    .send(uid, control_frame(message.kind, &message.content))
                    .await?;
            }
            Role::Assistant => {
                self.transport.send(uid, message.to_wire()).await?;
            }
        }
        if store {
            self.store_message(uid, &message).await?;
        }
        Ok(())
    }

    async fn emit_stream(
        &self,
        uid: &str,
        template: AnnotatedMessage,
        mut events: mpsc::Receiver<Result<GenEvent>>,
    ) -> Result<()> {
        let mut message = template;
        let mut content = String::new();
        let mut tool_calls: Option<Vec<ToolCallDescriptor>> = None;

        while let Some(event) = events.recv().await {
            match event? {
                GenEvent::Chunk { id, content: delta } => {
                    self.transport
                        .send(
                            uid,
                            json!({
                                "type": MessageKind::Stream,
                                "role": Role::Assistant,
                                "content": delta,
                                "id": id,
                            }),
                        )
                        .await?;
                    content.push_str(&delta);
                }
                GenEvent::ToolCalls { calls, .. } => tool_calls = Some(calls),
                GenEvent::Review {
                    harmful,
                    category_hits,
                    rationales,
                    original_output,
                } => {
                    message.model_output_harmful = Some(harmful);
                    message.model_output_harmful_categories = Some(category_hits);
                    message.model_output_harmful_rationales = Some(rationales);
                    message.original_harmful_output = original_output;
                }
            }
        }

        message.content = content;
        message.should_respond_tool_call = false;

        let Some(calls) = tool_calls else {
            if message.content.is_empty() {
                tracing::warn!("Empty completion for {}, nothing to emit", uid);
                return Ok(());
            }
            return self.emit(uid, message, true).await;
        };

        message.kind = MessageKind::Tool;
        message.tool_calls = Some(calls.clone());
        self.store_message(uid, &message).await?;

        let history = self.history_snapshot(uid).await?;
        let frontend = self
            .coordinator
            .process_tool_calls(uid, &calls, &history, &self.runner, self.transport.as_ref())
            .await?;

        if !frontend.is_empty() {
            // Ask the client to run its share of the batch; backend results
            // stay parked in the coordinator until the answers arrive.
            let mut request = message.clone();
            request.tool_calls = Some(frontend);
            request.should_respond_tool_call = true;
            self.transport.send(uid, request.to_wire()).await?;
            return Ok(());
        }

        if !message.content.is_empty() {
            self.transport.send(uid, message.to_wire()).await?;
        }
        let finished = self.coordinator.finish_tool_responses(uid, Vec::new()).await;
        if !finished.is_empty() {
            self.queue_followup(uid, finished);
        }
        Ok(())
    }
}

/// Keeps only the chronologically last tool reply per call id. Crash-resume
/// paths can double-record an answer; the model must see exactly one, and
/// the later record is the authoritative one.
fn sanitize_history(history: Vec<AnnotatedMessage>) -> Vec<AnnotatedMessage> {
    let mut last_reply: HashMap<String, usize> = HashMap::new();
    for (index, message) in history.iter().enumerate() {
        if message.role == Role::Tool {
            if let Some(call_id) = &message.tool_call_id {
                last_reply.insert(call_id.clone(), index);
            }
        }
    }

    history
        .into_iter()
        .enumerate()
        .filter(|(index, message)| {
            if message.role == Role::Tool {
                if let Some(call_id) = &message.tool_call_id {
                    if last_reply[call_id] != *index {
                        tracing::warn!("Dropping superseded tool reply for call {}", call_id);
                        return false;
                    }
                }
            }
            true
        })
        .map(|(_, message)| message)
        .collect()
}

/// Replay frames for a resumed session. Within one tool batch only the last
/// plan payload becomes a widget; replaying them all would stack stale plan
/// renders on the client.
fn replay_frames(history: &[AnnotatedMessage]) -> Vec<Value> {
    let visible: Vec<&AnnotatedMessage> = history.iter().filter(|m| !m.hidden).collect();
    let mut skip = vec![false; visible.len()];

    let mut i = 0;
    while i < visible.len() {
        if visible[i].role != Role::Tool {
            i += 1;
            continue;
        }
        let mut widgets = Vec::new();
        let mut j = i;
        while j < visible.len() && visible[j].role == Role::Tool {
            if is_plan_payload(&visible[j].content) {
                widgets.push(j);
            }
            j += 1;
        }
        if widgets.len() > 1 {
            for &w in &widgets[..widgets.len() - 1] {
                skip[w] = true;
            }
        }
        i = j;
    }

    visible
        .iter()
        .zip(&skip)
        .filter(|(_, skipped)| !**skipped)
        .map(|(message, _)| message.to_replay())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::StreamEvent;
    use crate::messages::{ToolCallFunction, ToolResponseMessage, UserChatMessage};
    use crate::plan::{WeeklyPlan, Workout};
    use crate::prompts;
    use crate::test_support::{FakeLlm, FakeTransport, FixedPlanGenerator};
    use crate::tools::{GENERATE_PLAN, QUERY_HEALTH_DATA};
    use serde_json::json;

    struct Harness {
        manager: Arc<SessionManager>,
        llm: Arc<FakeLlm>,
        transport: Arc<FakeTransport>,
        store: Arc<ChatStore>,
        scheduler: Arc<JobScheduler>,
    }

    fn harness(generator: FixedPlanGenerator) -> Harness {
        let store = Arc::new(ChatStore::in_memory().unwrap());
        store.ensure_user("u1").unwrap();
        let llm = Arc::new(FakeLlm::new());
        let transport = Arc::new(FakeTransport::new());
        let scheduler = Arc::new(JobScheduler::new());
        let plans = Arc::new(PlanService::new(Arc::clone(&store)));
        let summarizer = Arc::new(Summarizer::new(
            llm.clone() as Arc<dyn LlmClient>,
            Arc::clone(&store),
        ));
        let runner = Arc::new(BackendToolRunner::new(
            Arc::clone(&store),
            Arc::clone(&plans),
            Arc::new(generator),
            Arc::clone(&summarizer),
        ));
        let (coordinator, _timeout_rx) = ToolCoordinator::new(Duration::from_secs(5));
        let manager = Arc::new(SessionManager::new(
            Arc::clone(&store),
            transport.clone() as Arc<dyn Transport>,
            llm.clone() as Arc<dyn LlmClient>,
            runner,
            coordinator,
            Arc::clone(&scheduler),
            summarizer,
            plans,
            Arc::new(crate::notify::LoggingDispatcher::new(Arc::clone(&store))),
            Duration::from_secs(1800),
            Duration::from_secs(86400),
        ));
        Harness {
            manager,
            llm,
            transport,
            store,
            scheduler,
        }
    }

    fn frame_types(frames: &[Value]) -> Vec<String> {
        frames
            .iter()
            .map(|f| f["type"].as_str().unwrap_or("?").to_string())
            .collect()
    }

    fn user_message(content: &str) -> ClientMessage {
        ClientMessage::User(UserChatMessage {
            kind: MessageKind::Message,
            role: Role::User,
            content: content.to_string(),
            id: uuid::Uuid::new_v4().to_string(),
        })
    }

    fn chunk(id: &str, content: &str) -> StreamEvent {
        StreamEvent::TextDelta {
            id: id.to_string(),
            content: content.to_string(),
        }
    }

    fn tool_batch(call_id: &str, name: &str) -> StreamEvent {
        StreamEvent::ToolCallBatch {
            id: "batch-1".to_string(),
            calls: vec![ToolCallDescriptor {
                id: call_id.to_string(),
                call_type: "function".to_string(),
                function: ToolCallFunction {
                    name: name.to_string(),
                    arguments: "{}".to_string(),
                },
            }],
        }
    }

    fn clean_verdicts(llm: &FakeLlm) {
        for _ in 0..crate::safety::HARM_CATEGORIES.len() {
            llm.push_structured(json!({"rationale": "fine", "harmful": false}));
        }
    }

    fn one_day_plan() -> WeeklyPlan {
        let mut plan = WeeklyPlan::default();
        plan.workouts_by_day.insert(
            "monday".to_string(),
            vec![Workout {
                id: "w1".to_string(),
                workout_type: "walking".to_string(),
                time_start: "08:00".to_string(),
                duration_min: 30,
                intensity: "low".to_string(),
                location: None,
                completed: false,
            }],
        );
        plan
    }

    #[tokio::test]
    async fn fresh_onboarding_replays_nothing_and_greets_statically() {
        let h = harness(FixedPlanGenerator::empty());
        h.manager
            .start_conversation("u1", ChatMode::Onboarding)
            .await
            .unwrap();

        let frames = h.transport.frames_for("u1");
        assert_eq!(
            frame_types(&frames),
            vec!["acknowledgement", "progress", "message", "closing"]
        );
        assert_eq!(frames[1]["content"], json!("introduction"));
        assert_eq!(frames[2]["content"], json!(prompts::ONBOARDING_INTRO));

        let tz = h.store.user_timezone("u1").unwrap();
        let session_id = h
            .store
            .resolve_session("u1", "onboarding", Utc::now(), &tz)
            .unwrap();
        let history = h.store.load_history("u1", &session_id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].strategy.as_deref(), Some("Filler"));
    }

    #[tokio::test]
    async fn user_turn_streams_and_persists_an_annotated_reply() {
        let h = harness(FixedPlanGenerator::empty());
        h.manager
            .start_conversation("u1", ChatMode::Onboarding)
            .await
            .unwrap();

        h.llm
            .push_structured(json!({"rationale": "just met", "transition": "continue"}));
        h.llm.push_structured(json!({"strategy": "Question"}));
        h.llm
            .push_stream(vec![chunk("m1", "Great to "), chunk("m1", "hear!")]);
        clean_verdicts(&h.llm);

        h.manager
            .process_client_message("u1", user_message("hi, I want to move more"))
            .await
            .unwrap();

        let frames = h.transport.frames_for("u1");
        let types = frame_types(&frames);
        assert!(types.contains(&"stream".to_string()));
        let reply = frames
            .iter()
            .rev()
            .find(|f| f["type"] == json!("message"))
            .unwrap();
        assert_eq!(reply["content"], json!("Great to hear!"));

        let tz = h.store.user_timezone("u1").unwrap();
        let session_id = h
            .store
            .resolve_session("u1", "onboarding", Utc::now(), &tz)
            .unwrap();
        let history = h.store.load_history("u1", &session_id).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].role, Role::User);
        assert_eq!(history[1].user_input_harmful, Some(false));
        assert_eq!(history[2].strategy.as_deref(), Some("Question"));
        assert_eq!(history[2].end_state.as_deref(), Some("introduction"));
        assert_eq!(history[2].model_output_harmful, Some(false));
    }

    #[tokio::test]
    async fn flagged_input_gets_the_canned_reply_without_generation() {
        let h = harness(FixedPlanGenerator::empty());
        h.manager
            .start_conversation("u1", ChatMode::Onboarding)
            .await
            .unwrap();

        h.llm
            .push_structured(json!({"rationale": "still intro", "transition": "continue"}));
        h.llm.push_moderation(true, &["out of scope"]);
        // No stream scripted: generation would fail the turn.

        h.manager
            .process_client_message("u1", user_message("tell me something harmful"))
            .await
            .unwrap();

        let frames = h.transport.frames_for("u1");
        let reply = frames
            .iter()
            .rev()
            .find(|f| f["type"] == json!("message"))
            .unwrap();
        assert_eq!(reply["content"], json!(prompts::HARMFUL_INPUT_RESPONSE));

        let tz = h.store.user_timezone("u1").unwrap();
        let session_id = h
            .store
            .resolve_session("u1", "onboarding", Utc::now(), &tz)
            .unwrap();
        let history = h.store.load_history("u1", &session_id).unwrap();
        assert_eq!(history[1].user_input_harmful, Some(true));
        assert_eq!(
            history[1].user_input_harmful_categories,
            Some(vec!["out of scope".to_string()])
        );
    }

    #[tokio::test]
    async fn backend_tool_call_runs_a_follow_up_turn_in_the_same_exchange() {
        let h = harness(FixedPlanGenerator::with_plan(
            one_day_plan(),
            "Here is your first plan!",
        ));
        h.manager
            .start_conversation("u1", ChatMode::Onboarding)
            .await
            .unwrap();

        // First turn: the model calls generate_plan.
        h.llm
            .push_structured(json!({"rationale": "goal agreed", "transition": "continue"}));
        h.llm.push_structured(json!({"strategy": "Structure"}));
        h.llm.push_stream(vec![tool_batch("c1", GENERATE_PLAN)]);
        // Follow-up turn over the tool result.
        h.llm
            .push_structured(json!({"rationale": "plan made", "transition": "continue"}));
        h.llm.push_structured(json!({"strategy": "Affirm"}));
        h.llm.push_stream(vec![chunk("m2", "Your plan is ready!")]);
        clean_verdicts(&h.llm);

        h.manager
            .process_client_message("u1", user_message("let's lock in the plan"))
            .await
            .unwrap();

        let frames = h.transport.frames_for("u1");
        let types = frame_types(&frames);
        assert!(types.contains(&"plan-widget".to_string()));
        assert_eq!(types.last().unwrap(), "closing");
        assert_eq!(
            types.iter().filter(|t| *t == "closing").count(),
            2 // one from the opening, one from this exchange
        );

        let tz = h.store.user_timezone("u1").unwrap();
        let session_id = h
            .store
            .resolve_session("u1", "onboarding", Utc::now(), &tz)
            .unwrap();
        let history = h.store.load_history("u1", &session_id).unwrap();
        // intro, user, tool request, tool result, final reply
        assert_eq!(history.len(), 5);
        assert_eq!(history[2].kind, MessageKind::Tool);
        assert_eq!(history[3].role, Role::Tool);
        assert!(is_plan_payload(&history[3].content));
        assert_eq!(history[4].content, "Your plan is ready!");

        assert_eq!(h.store.plan_history("u1", 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn frontend_tool_call_waits_for_the_client_answer() {
        let h = harness(FixedPlanGenerator::empty());
        // Open chat with no history streams a generated greeting.
        h.llm.push_stream(vec![chunk("i1", "Hey, welcome back!")]);
        clean_verdicts(&h.llm);
        h.manager
            .start_conversation("u1", ChatMode::AtWill)
            .await
            .unwrap();

        h.llm.push_stream(vec![tool_batch("c7", QUERY_HEALTH_DATA)]);
        h.manager
            .process_client_message("u1", user_message("how many steps yesterday?"))
            .await
            .unwrap();

        let frames = h.transport.frames_for("u1");
        let request = frames
            .iter()
            .rev()
            .find(|f| f["type"] == json!("tool"))
            .unwrap();
        assert_eq!(request["should_respond_tool_call"], json!(true));
        assert_eq!(request["tool_calls"][0]["id"], json!("c7"));

        // The client answers; the follow-up turn produces the final reply.
        h.llm.push_stream(vec![chunk("m3", "You walked 7,500 steps.")]);
        clean_verdicts(&h.llm);
        h.manager
            .process_client_message(
                "u1",
                ClientMessage::ToolResponses(ToolResponseMessage {
                    tool_responses: vec![ToolResponsePayload {
                        tool_call_id: "c7".to_string(),
                        content: "7500".to_string(),
                        role: "tool".to_string(),
                        name: QUERY_HEALTH_DATA.to_string(),
                    }],
                }),
            )
            .await
            .unwrap();

        let tz = h.store.user_timezone("u1").unwrap();
        let session_id = h
            .store
            .resolve_session("u1", "at_will", Utc::now(), &tz)
            .unwrap();
        let history = h.store.load_history("u1", &session_id).unwrap();
        let tool_reply = history.iter().find(|m| m.role == Role::Tool).unwrap();
        assert_eq!(tool_reply.content, "7500");
        assert_eq!(
            history.last().unwrap().content,
            "You walked 7,500 steps."
        );
    }

    #[tokio::test]
    async fn pending_opener_is_delivered_and_debounces_a_summary() {
        let h = harness(FixedPlanGenerator::empty());
        h.store
            .set_pending_message("u1", "How did Monday's walk go?")
            .unwrap();
        // Nothing scripted: a generated intro would fail.
        h.manager
            .start_conversation("u1", ChatMode::AtWill)
            .await
            .unwrap();

        let frames = h.transport.frames_for("u1");
        let opener = frames
            .iter()
            .find(|f| f["type"] == json!("message"))
            .unwrap();
        assert_eq!(opener["content"], json!("How did Monday's walk go?"));

        let tz = h.store.user_timezone("u1").unwrap();
        let session_id = h
            .store
            .resolve_session("u1", "at_will", Utc::now(), &tz)
            .unwrap();
        assert!(h.scheduler.is_pending(&JobKey::Summary {
            uid: "u1".to_string(),
            session_id,
        }));
        // Delivered exactly once.
        assert!(h.store.take_pending_message("u1").unwrap().is_none());
    }

    #[tokio::test]
    async fn reaching_goodbye_schedules_summary_and_check_in_advance() {
        let h = harness(FixedPlanGenerator::empty());
        // Seed a session already sitting in the advice state.
        let tz = h.store.user_timezone("u1").unwrap();
        let session_id = h
            .store
            .resolve_session("u1", "onboarding", Utc::now(), &tz)
            .unwrap();
        let seeded = AnnotatedMessage::new(
            MessageKind::Message,
            Role::Assistant,
            "Any questions before we wrap up?",
        )
        .with_states("advice", "advice");
        h.store.append_message("u1", &session_id, &seeded).unwrap();

        h.manager
            .start_conversation("u1", ChatMode::Onboarding)
            .await
            .unwrap();

        h.llm
            .push_structured(json!({"rationale": "all set", "transition": "completed"}));
        h.llm.push_structured(json!({"strategy": "Support"}));
        h.llm.push_stream(vec![chunk("m4", "Talk soon, take care!")]);
        clean_verdicts(&h.llm);

        h.manager
            .process_client_message("u1", user_message("nope, all clear, thanks!"))
            .await
            .unwrap();

        assert!(h.scheduler.is_pending(&JobKey::Summary {
            uid: "u1".to_string(),
            session_id: session_id.clone(),
        }));
        assert!(h.scheduler.is_pending(&JobKey::CheckInAdvance {
            uid: "u1".to_string(),
        }));

        let history = h.store.load_history("u1", &session_id).unwrap();
        assert_eq!(history.last().unwrap().end_state.as_deref(), Some("goodbye"));
    }

    #[test]
    fn sanitize_keeps_the_last_duplicate_tool_reply_and_is_idempotent() {
        let mut request = AnnotatedMessage::new(MessageKind::Tool, Role::Assistant, "");
        request.tool_calls = Some(vec![ToolCallDescriptor {
            id: "c1".to_string(),
            call_type: "function".to_string(),
            function: ToolCallFunction {
                name: QUERY_HEALTH_DATA.to_string(),
                arguments: "{}".to_string(),
            },
        }]);
        let stale = AnnotatedMessage::new(MessageKind::Message, Role::Tool, "stale answer")
            .with_tool_call_id(Some("c1".to_string()));
        let fresh = AnnotatedMessage::new(MessageKind::Message, Role::Tool, "fresh answer")
            .with_tool_call_id(Some("c1".to_string()));

        let once = sanitize_history(vec![request, stale, fresh]);
        assert_eq!(once.len(), 2);
        assert_eq!(once[1].content, "fresh answer");
        let twice = sanitize_history(once.clone());
        assert_eq!(twice.len(), once.len());
        assert_eq!(twice[1].content, "fresh answer");
    }

    #[test]
    fn replay_keeps_only_the_last_widget_of_a_batch() {
        let payload = |message: &str| {
            json!({"message": message, "revision_message": "", "plan": {}}).to_string()
        };
        let older = AnnotatedMessage::new(MessageKind::Message, Role::Tool, payload("first"))
            .with_tool_call_id(Some("c1".to_string()));
        let newer = AnnotatedMessage::new(MessageKind::Message, Role::Tool, payload("second"))
            .with_tool_call_id(Some("c2".to_string()));
        let reply = AnnotatedMessage::new(MessageKind::Message, Role::Assistant, "done");

        let frames = replay_frames(&[older, newer, reply]);
        let widgets: Vec<&Value> = frames
            .iter()
            .filter(|f| f["type"] == json!("plan-widget"))
            .collect();
        assert_eq!(widgets.len(), 1);
        assert!(widgets[0]["content"].as_str().unwrap().contains("second"));
        // Replayed frames never request tool answers.
        assert!(frames.iter().all(|f| f["should_respond_tool_call"] == json!(false)));
    }
}
