//! The per-turn pipeline.
//!
//! One pipeline handles every chat mode; the differences between onboarding,
//! weekly check-in, and open chat are captured in a [`ModeProfile`] instead
//! of separate implementations. A turn runs: state resolution, input
//! moderation, strategy selection, context assembly, buffered generation,
//! output review, and replay-or-revision streaming. Emission goes through
//! the [`ResponseSink`] owned by the session layer.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::dialogue::{DialogueStateModule, INITIAL_STATE};
use crate::llm::{system_message, LlmClient, StreamEvent};
use crate::memory::Summarizer;
use crate::messages::{
    AnnotatedMessage, MessageKind, Role, ToolCallDescriptor, ToolResponsePayload,
    UserChatMessage,
};
use crate::plan::PlanService;
use crate::prompts;
use crate::safety::SafetyFilter;
use crate::store::ChatStore;
use crate::strategy::StrategySelector;
use crate::tools::{self, GENERATE_PLAN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatMode {
    Onboarding,
    CheckIn,
    AtWill,
}

impl ChatMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatMode::Onboarding => "onboarding",
            ChatMode::CheckIn => "check_in",
            ChatMode::AtWill => "at_will",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "onboarding" => Ok(ChatMode::Onboarding),
            "check_in" => Ok(ChatMode::CheckIn),
            "at_will" => Ok(ChatMode::AtWill),
            other => bail!("Unknown chat mode '{}'", other),
        }
    }
}

/// When a session's summary job is kicked off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPolicy {
    /// Summarize as soon as a turn ends in the goodbye state.
    OnGoodbye,
    /// Summarize after a quiet period, re-debounced by every turn.
    Debounced,
}

/// Vetoes leaving `gate_state` until `required_tool` has been called at
/// least once in the session.
#[derive(Debug, Clone)]
pub struct StateGuard {
    pub gate_state: &'static str,
    pub required_tool: &'static str,
}

pub struct ModeProfile {
    pub mode: ChatMode,
    pub dialogue: Option<Arc<DialogueStateModule>>,
    pub guard: Option<StateGuard>,
    pub memory_policy: MemoryPolicy,
}

impl ModeProfile {
    pub fn onboarding() -> Result<Self> {
        Ok(Self {
            mode: ChatMode::Onboarding,
            dialogue: Some(Arc::new(DialogueStateModule::onboarding()?)),
            guard: Some(StateGuard {
                gate_state: "goal_setting",
                required_tool: GENERATE_PLAN,
            }),
            memory_policy: MemoryPolicy::OnGoodbye,
        })
    }

    pub fn check_in() -> Result<Self> {
        Ok(Self {
            mode: ChatMode::CheckIn,
            dialogue: Some(Arc::new(DialogueStateModule::check_in()?)),
            guard: Some(StateGuard {
                gate_state: "goal_setting",
                required_tool: GENERATE_PLAN,
            }),
            memory_policy: MemoryPolicy::OnGoodbye,
        })
    }

    pub fn at_will() -> Self {
        Self {
            mode: ChatMode::AtWill,
            dialogue: None,
            guard: None,
            memory_policy: MemoryPolicy::Debounced,
        }
    }

    pub fn for_mode(mode: ChatMode) -> Result<Self> {
        match mode {
            ChatMode::Onboarding => Self::onboarding(),
            ChatMode::CheckIn => Self::check_in(),
            ChatMode::AtWill => Ok(Self::at_will()),
        }
    }

    fn context_blurb(&self) -> String {
        match self.mode {
            ChatMode::Onboarding => prompts::onboarding_context(),
            ChatMode::CheckIn => prompts::check_in_context(),
            ChatMode::AtWill => prompts::open_chat_context(),
        }
    }
}

/// One incoming turn, normalized by the session layer.
#[derive(Debug, Clone)]
pub enum IncomingTurn {
    User(UserChatMessage),
    ToolResponses(Vec<ToolResponsePayload>),
}

/// Events of one generated assistant message, after the output gate.
#[derive(Debug, Clone)]
pub enum GenEvent {
    Chunk {
        id: String,
        content: String,
    },
    ToolCalls {
        id: String,
        calls: Vec<ToolCallDescriptor>,
    },
    /// Review verdict over the buffered draft; sent once, after the text.
    Review {
        harmful: bool,
        category_hits: Vec<bool>,
        rationales: Vec<String>,
        original_output: Option<String>,
    },
}

/// Where pipeline output goes. Implemented by the session manager, which
/// owns transports, persistence, and tool-call follow-up.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    async fn emit(&self, uid: &str, message: AnnotatedMessage, store: bool) -> Result<()>;

    /// Consumes a generation stream into one assistant message shaped like
    /// `template`.
    async fn emit_stream(
        &self,
        uid: &str,
        template: AnnotatedMessage,
        events: mpsc::Receiver<Result<GenEvent>>,
    ) -> Result<()>;
}

pub struct TurnPipeline {
    profile: ModeProfile,
    llm: Arc<dyn LlmClient>,
    safety: SafetyFilter,
    strategy: StrategySelector,
    plans: Arc<PlanService>,
    memory: Arc<Summarizer>,
    store: Arc<ChatStore>,
}

impl TurnPipeline {
    pub fn new(
        profile: ModeProfile,
        llm: Arc<dyn LlmClient>,
        plans: Arc<PlanService>,
        memory: Arc<Summarizer>,
        store: Arc<ChatStore>,
    ) -> Self {
        let safety = SafetyFilter::new(Arc::clone(&llm));
        Self {
            profile,
            llm,
            safety,
            strategy: StrategySelector::new(),
            plans,
            memory,
            store,
        }
    }

    pub fn mode(&self) -> ChatMode {
        self.profile.mode
    }

    pub fn memory_policy(&self) -> MemoryPolicy {
        self.profile.memory_policy
    }

    /// Runs one turn. `store_incoming` is false when a resumed message is
    /// being reprocessed and is already persisted.
    pub async fn process_message(
        &self,
        uid: &str,
        turn: IncomingTurn,
        mut history: Vec<AnnotatedMessage>,
        sink: &dyn ResponseSink,
        store_incoming: bool,
    ) -> Result<()> {
        // Normalize the turn into one processed message, emitting any extra
        // tool answers into history first.
        let mut processed = match turn {
            IncomingTurn::User(message) => {
                AnnotatedMessage::new(message.kind, Role::User, message.content)
                    .with_id(message.id)
            }
            IncomingTurn::ToolResponses(mut responses) => {
                if responses.is_empty() {
                    bail!("Empty tool response batch");
                }
                let last = responses.pop().unwrap();
                for response in responses {
                    let message = self.tool_message(&response);
                    sink.emit(uid, message.clone(), store_incoming).await?;
                    history.push(message);
                }
                self.tool_message(&last)
            }
        };

        // Dialogue state resolution, with the plan-generation guard.
        let step = match &self.profile.dialogue {
            Some(dialogue) => {
                let mut lookahead = history.clone();
                lookahead.push(processed.clone());
                let mut step = dialogue.next_state(self.llm.as_ref(), &lookahead).await?;
                if let Some(guard) = &self.profile.guard {
                    if step.start_state == guard.gate_state
                        && step.end_state != guard.gate_state
                        && !history_has_tool_call(&history, guard.required_tool)
                    {
                        tracing::info!(
                            "Holding {} in '{}': no {} call yet",
                            uid,
                            guard.gate_state,
                            guard.required_tool
                        );
                        let gate = dialogue
                            .state(guard.gate_state)
                            .context("Guard references unknown state")?;
                        step.end_state = gate.id.clone();
                        step.task_prompt = gate.prompt.clone();
                    }
                }
                Some(step)
            }
            None => None,
        };

        let task_prompt = step
            .as_ref()
            .map(|s| s.task_prompt.clone())
            .unwrap_or_else(|| prompts::OPEN_CHAT_TASK.to_string());

        if let Some(step) = &step {
            processed.start_state = Some(step.start_state.clone());
            processed.end_state = Some(step.end_state.clone());
        }

        // Input moderation, user turns only.
        if processed.role == Role::User {
            let verdict = self.safety.moderate_user_input(&processed.content).await?;
            processed.user_input_harmful = Some(verdict.flagged);
            if verdict.flagged {
                tracing::warn!(
                    "Flagged user input from {} ({})",
                    uid,
                    verdict.categories.join(", ")
                );
                processed.user_input_harmful_categories = Some(verdict.categories);
                sink.emit(uid, processed, store_incoming).await?;

                let mut canned = AnnotatedMessage::new(
                    MessageKind::Message,
                    Role::Assistant,
                    prompts::HARMFUL_INPUT_RESPONSE,
                );
                if let Some(step) = &step {
                    canned = canned.with_states(step.end_state.clone(), step.end_state.clone());
                }
                sink.emit(uid, canned, true).await?;
                return Ok(());
            }
        }

        if let Some(step) = &step {
            let progress =
                AnnotatedMessage::new(MessageKind::Progress, Role::System, &step.end_state);
            sink.emit(uid, progress, false).await?;
        }

        // Strategy selection steers state-driven modes; open chat flows free.
        let strategy = match &step {
            Some(_) => {
                let mut lookahead = history.clone();
                lookahead.push(processed.clone());
                Some(
                    self.strategy
                        .predict(self.llm.as_ref(), &lookahead, &task_prompt)
                        .await?,
                )
            }
            None => None,
        };

        let llm_messages = self
            .build_llm_messages(uid, &history, &processed, &task_prompt, &strategy)
            .await?;

        sink.emit(uid, processed.clone(), store_incoming).await?;
        history.push(processed.clone());

        let mut template = AnnotatedMessage::new(MessageKind::Message, Role::Assistant, "");
        if let Some(step) = &step {
            template = template.with_states(step.end_state.clone(), step.end_state.clone());
        }
        if let Some((name, _)) = &strategy {
            template = template.with_strategy(name.clone());
        }

        let events = self.spawn_generation(
            processed.content.clone(),
            history,
            llm_messages,
            tools::available_tools(self.profile.mode),
        );
        sink.emit_stream(uid, template, events).await
    }

    /// Opens (or resumes) a conversation over freshly loaded history.
    pub async fn start_conversation(
        &self,
        uid: &str,
        mut history: Vec<AnnotatedMessage>,
        sink: &dyn ResponseSink,
    ) -> Result<()> {
        // A server-pushed opener waiting on the user document takes priority
        // over generating one.
        if self.profile.mode == ChatMode::AtWill {
            if let Some(pending) = self.store.take_pending_message(uid)? {
                let message =
                    AnnotatedMessage::new(MessageKind::Message, Role::Assistant, pending);
                sink.emit(uid, message, true).await?;
                return Ok(());
            }
        }

        if history.is_empty() {
            return self.open_fresh(uid, sink).await;
        }

        // Resume: a dangling turn at the tail is fed back through the
        // pipeline so the user gets the answer they were owed.
        let last = history.last().cloned().context("History cannot be empty here")?;
        match last.role {
            Role::User => {
                history.pop();
                let turn = IncomingTurn::User(UserChatMessage {
                    kind: last.kind,
                    role: last.role,
                    content: last.content,
                    id: last.id,
                });
                self.process_message(uid, turn, history, sink, false).await
            }
            Role::Tool => {
                let Some(tool_call_id) = last.tool_call_id.clone() else {
                    tracing::warn!("Dangling tool message without call id for {}", uid);
                    return Ok(());
                };
                history.pop();
                let turn = IncomingTurn::ToolResponses(vec![ToolResponsePayload {
                    tool_call_id,
                    content: last.content,
                    role: "tool".to_string(),
                    name: "tool".to_string(),
                }]);
                self.process_message(uid, turn, history, sink, false).await
            }
            Role::Assistant => {
                let Some(calls) = last.tool_calls.clone().filter(|c| !c.is_empty()) else {
                    return Ok(());
                };
                // The client never answered these; give the model timeout
                // errors so it can move on.
                let errors = calls
                    .iter()
                    .map(|call| tools::error_tool_response(&call.id, tools::TOOL_TIMEOUT_MESSAGE))
                    .collect();
                self.process_message(uid, IncomingTurn::ToolResponses(errors), history, sink, true)
                    .await
            }
            Role::System => Ok(()),
        }
    }

    async fn open_fresh(&self, uid: &str, sink: &dyn ResponseSink) -> Result<()> {
        if self.profile.mode == ChatMode::Onboarding {
            let intro = AnnotatedMessage::new(
                MessageKind::Message,
                Role::Assistant,
                prompts::ONBOARDING_INTRO,
            )
            .with_states(INITIAL_STATE, INITIAL_STATE)
            .with_strategy("Filler");
            return sink.emit(uid, intro, true).await;
        }

        // Check-in and open chat greet dynamically from what the coach
        // remembers.
        let blurb = self.profile.context_blurb();
        let system = self.assemble_system_prompt(uid, &prompts::intro_task(&blurb)).await?;

        let mut template = AnnotatedMessage::new(MessageKind::Message, Role::Assistant, "");
        if self.profile.dialogue.is_some() {
            template = template.with_states(INITIAL_STATE, INITIAL_STATE);
        }

        let events = self.spawn_generation(
            String::new(),
            Vec::new(),
            vec![system_message(system)],
            tools::available_tools(self.profile.mode),
        );
        sink.emit_stream(uid, template, events).await
    }

    fn tool_message(&self, response: &ToolResponsePayload) -> AnnotatedMessage {
        AnnotatedMessage::new(MessageKind::Message, Role::Tool, response.content.clone())
            .with_tool_call_id(Some(response.tool_call_id.clone()))
    }

    async fn assemble_system_prompt(&self, uid: &str, blurb: &str) -> Result<String> {
        let tz = self.store.user_timezone(uid)?;
        let local_time = Utc::now()
            .with_timezone(&tz)
            .format("%A %H:%M, %B %d %Y")
            .to_string();
        let plan_history = self.plans.plan_history_text(uid)?;
        let ambient = self.plans.ambient_history_text(uid)?;
        let memory = match self.profile.mode {
            ChatMode::Onboarding => String::new(),
            _ => self.memory.retrieve(uid)?,
        };
        Ok(prompts::system_prompt(
            blurb,
            &local_time,
            &plan_history,
            &ambient,
            &memory,
        ))
    }

    async fn build_llm_messages(
        &self,
        uid: &str,
        history: &[AnnotatedMessage],
        processed: &AnnotatedMessage,
        task_prompt: &str,
        strategy: &Option<(String, &'static str)>,
    ) -> Result<Vec<Value>> {
        let system = self
            .assemble_system_prompt(uid, &self.profile.context_blurb())
            .await?;

        let mut llm_messages = vec![system_message(system)];
        llm_messages.extend(AnnotatedMessage::history_to_llm(history));
        llm_messages.push(processed.to_llm());

        if let Some((name, text)) = strategy {
            llm_messages.push(crate::llm::assistant_message(prompts::task_steering(
                task_prompt,
                name,
                text,
            )));
        }
        Ok(llm_messages)
    }

    /// Buffers the whole completion, reviews it, then re-streams either the
    /// original chunks or a revision.
    fn spawn_generation(
        &self,
        user_input: String,
        history: Vec<AnnotatedMessage>,
        llm_messages: Vec<Value>,
        tool_defs: Vec<Value>,
    ) -> mpsc::Receiver<Result<GenEvent>> {
        let (tx, rx) = mpsc::channel(64);
        let llm = Arc::clone(&self.llm);
        let safety = self.safety.clone();

        tokio::spawn(async move {
            let outcome = generate_and_review(
                llm.as_ref(),
                &safety,
                &user_input,
                &history,
                llm_messages,
                tool_defs,
                &tx,
            )
            .await;
            if let Err(e) = outcome {
                tracing::error!("Generation failed: {:#}", e);
                let _ = tx.send(Err(e)).await;
            }
        });
        rx
    }
}

fn history_has_tool_call(history: &[AnnotatedMessage], tool: &str) -> bool {
    history.iter().any(|message| {
        message
            .tool_calls
            .as_ref()
            .map(|calls| calls.iter().any(|call| call.function.name == tool))
            .unwrap_or(false)
    })
}

async fn generate_and_review(
    llm: &dyn LlmClient,
    safety: &SafetyFilter,
    user_input: &str,
    history: &[AnnotatedMessage],
    llm_messages: Vec<Value>,
    tool_defs: Vec<Value>,
    tx: &mpsc::Sender<Result<GenEvent>>,
) -> Result<()> {
    let mut stream = llm.stream(llm_messages, tool_defs).await?;

    let mut chunks: Vec<(String, String)> = Vec::new();
    let mut tool_batch: Option<(String, Vec<ToolCallDescriptor>)> = None;
    while let Some(event) = stream.recv().await {
        match event? {
            StreamEvent::TextDelta { id, content } => chunks.push((id, content)),
            StreamEvent::ToolCallBatch { id, calls } => tool_batch = Some((id, calls)),
        }
    }

    let full_text: String = chunks.iter().map(|(_, content)| content.as_str()).collect();

    if !full_text.is_empty() {
        let review = safety.review_output(user_input, &full_text).await?;
        if review.harmful() {
            tracing::warn!(
                "Draft flagged ({}); streaming revision",
                review.flagged_category_names().join(", ")
            );
            if tool_batch.is_some() {
                tracing::warn!("Dropping tool calls attached to a flagged draft");
            }
            let mut revision = safety
                .revise_output(history, user_input, &full_text, &review)
                .await?;
            while let Some(event) = revision.recv().await {
                match event? {
                    StreamEvent::TextDelta { id, content } => {
                        if tx.send(Ok(GenEvent::Chunk { id, content })).await.is_err() {
                            return Ok(());
                        }
                    }
                    StreamEvent::ToolCallBatch { .. } => {}
                }
            }
            let _ = tx
                .send(Ok(GenEvent::Review {
                    harmful: true,
                    category_hits: review.category_hits,
                    rationales: review.rationales,
                    original_output: Some(full_text),
                }))
                .await;
            return Ok(());
        }

        for (id, content) in chunks {
            if tx.send(Ok(GenEvent::Chunk { id, content })).await.is_err() {
                return Ok(());
            }
        }
        let _ = tx
            .send(Ok(GenEvent::Review {
                harmful: false,
                category_hits: review.category_hits,
                rationales: review.rationales,
                original_output: None,
            }))
            .await;
    }

    if let Some((id, calls)) = tool_batch {
        let _ = tx.send(Ok(GenEvent::ToolCalls { id, calls })).await;
    }
    Ok(())
}
