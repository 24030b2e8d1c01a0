//! Declarative dialogue-state machine.
//!
//! Each state-driven chat mode ships a TOML graph: a chain of states, each
//! with a coaching task prompt and a transition rule. Classifier transitions
//! ask the model whether the current task is finished; direct transitions
//! jump unconditionally. The terminal `goodbye` state self-loops so a session
//! can keep receiving messages after it has wound down.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::json;

use crate::llm::{self, object_schema, system_message, LlmClient};
use crate::messages::{AnnotatedMessage, Role};
use crate::prompts;

pub const INITIAL_STATE: &str = "introduction";

const ONBOARDING_GRAPH: &str = include_str!("onboarding.toml");
const CHECK_IN_GRAPH: &str = include_str!("check_in.toml");

#[derive(Debug, Clone)]
pub enum Transition {
    Direct {
        next: String,
    },
    Classified {
        task_prompt: String,
        edges: BTreeMap<String, String>,
    },
}

#[derive(Debug, Clone)]
pub struct DialogueState {
    pub id: String,
    pub prompt: String,
    pub transition: Transition,
}

/// One resolved step: where the turn started, where it ends, and the task
/// prompt for the end state.
#[derive(Debug, Clone)]
pub struct StateStep {
    pub start_state: String,
    pub end_state: String,
    pub task_prompt: String,
}

#[derive(Debug, Deserialize)]
struct RawGraph {
    start: String,
    states: Vec<RawState>,
}

#[derive(Debug, Deserialize)]
struct RawState {
    id: String,
    prompt: String,
    transition: RawTransition,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RawTransition {
    Direct {
        next: String,
    },
    Classifier {
        task: String,
        edges: BTreeMap<String, String>,
    },
}

#[derive(Debug, Deserialize)]
struct TransitionChoice {
    #[allow(dead_code)]
    rationale: String,
    transition: String,
}

#[derive(Debug)]
pub struct DialogueStateModule {
    start: String,
    states: HashMap<String, DialogueState>,
}

impl DialogueStateModule {
    pub fn onboarding() -> Result<Self> {
        Self::from_toml(ONBOARDING_GRAPH).context("Invalid onboarding dialogue graph")
    }

    pub fn check_in() -> Result<Self> {
        Self::from_toml(CHECK_IN_GRAPH).context("Invalid check-in dialogue graph")
    }

    pub fn from_toml(source: &str) -> Result<Self> {
        let raw: RawGraph = toml::from_str(source).context("Failed to parse dialogue graph")?;

        let mut states = HashMap::new();
        for raw_state in raw.states {
            let transition = match raw_state.transition {
                RawTransition::Direct { next } => Transition::Direct { next },
                RawTransition::Classifier { task, edges } => {
                    let keys: Vec<&str> = edges.keys().map(String::as_str).collect();
                    if keys != ["completed", "continue"] {
                        bail!(
                            "State '{}' classifier edges must be exactly {{continue, completed}}, got {:?}",
                            raw_state.id,
                            keys
                        );
                    }
                    Transition::Classified {
                        task_prompt: task,
                        edges,
                    }
                }
            };
            if states
                .insert(
                    raw_state.id.clone(),
                    DialogueState {
                        id: raw_state.id.clone(),
                        prompt: raw_state.prompt,
                        transition,
                    },
                )
                .is_some()
            {
                bail!("Duplicate dialogue state '{}'", raw_state.id);
            }
        }

        let module = Self {
            start: raw.start,
            states,
        };
        module.validate()?;
        Ok(module)
    }

    fn validate(&self) -> Result<()> {
        if self.start != INITIAL_STATE {
            bail!(
                "Dialogue graph must start at '{}', got '{}'",
                INITIAL_STATE,
                self.start
            );
        }
        if !self.states.contains_key(&self.start) {
            bail!("Start state '{}' is not defined", self.start);
        }

        for state in self.states.values() {
            for target in state.transition_targets() {
                if !self.states.contains_key(target) {
                    bail!(
                        "State '{}' transitions to undefined state '{}'",
                        state.id,
                        target
                    );
                }
            }
        }

        // The completion path must be an acyclic chain ending in a
        // self-looping terminal state.
        let mut visited = HashSet::new();
        let mut current = self.start.as_str();
        loop {
            if !visited.insert(current.to_string()) {
                bail!("Dialogue graph has a cycle through '{}'", current);
            }
            let state = &self.states[current];
            let next = match &state.transition {
                Transition::Direct { next } => next,
                Transition::Classified { edges, .. } => &edges["completed"],
            };
            if next == current {
                match &state.transition {
                    Transition::Direct { .. } => return Ok(()),
                    Transition::Classified { .. } => {
                        bail!("Terminal state '{}' must use a direct transition", current)
                    }
                }
            }
            current = next;
        }
    }

    pub fn state(&self, id: &str) -> Option<&DialogueState> {
        self.states.get(id)
    }

    /// Resolves the step for the next turn. With no assistant turn yet the
    /// conversation is in the initial state; otherwise the most recent
    /// assistant end state anchors the transition.
    pub async fn next_state(
        &self,
        llm: &dyn LlmClient,
        history: &[AnnotatedMessage],
    ) -> Result<StateStep> {
        let current_id = history
            .iter()
            .rev()
            .filter(|m| m.role == Role::Assistant)
            .find_map(|m| m.end_state.clone());

        let Some(current_id) = current_id else {
            let start = &self.states[&self.start];
            return Ok(StateStep {
                start_state: start.id.clone(),
                end_state: start.id.clone(),
                task_prompt: start.prompt.clone(),
            });
        };

        let current = self
            .state(&current_id)
            .with_context(|| format!("History references unknown state '{}'", current_id))?;

        let next_id = match &current.transition {
            Transition::Direct { next } => next.clone(),
            Transition::Classified { task_prompt, edges } => {
                let history_text = prompts::render_history(history);
                let choice: TransitionChoice = llm::structured(
                    llm,
                    vec![system_message(prompts::transition_classifier_prompt(
                        &history_text,
                        task_prompt,
                    ))],
                    "state_transition",
                    transition_schema(),
                )
                .await?;
                edges
                    .get(&choice.transition)
                    .with_context(|| {
                        format!(
                            "Classifier returned unknown transition '{}' in state '{}'",
                            choice.transition, current_id
                        )
                    })?
                    .clone()
            }
        };

        let next = self
            .state(&next_id)
            .with_context(|| format!("Transition target '{}' is not defined", next_id))?;

        Ok(StateStep {
            start_state: current_id,
            end_state: next.id.clone(),
            task_prompt: next.prompt.clone(),
        })
    }
}

impl DialogueState {
    fn transition_targets(&self) -> Vec<&str> {
        match &self.transition {
            Transition::Direct { next } => vec![next.as_str()],
            Transition::Classified { edges, .. } => {
                edges.values().map(String::as_str).collect()
            }
        }
    }
}

fn transition_schema() -> serde_json::Value {
    object_schema(json!({
        "rationale": {"type": "string"},
        "transition": {"type": "string", "enum": ["continue", "completed"]},
    }))
}
