//! Shared fakes for unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use chrono::NaiveDate;

use crate::llm::{LlmClient, ModerationVerdict, StreamEvent};
use crate::messages::AnnotatedMessage;
use crate::plan::{PlanGenerator, WeeklyPlan};
use crate::transport::Transport;

/// Scripted LLM: queues of canned answers, popped in call order.
#[derive(Default)]
pub struct FakeLlm {
    pub completions: Mutex<VecDeque<String>>,
    pub structured: Mutex<VecDeque<Value>>,
    pub streams: Mutex<VecDeque<Vec<StreamEvent>>>,
    pub moderations: Mutex<VecDeque<ModerationVerdict>>,
    pub structured_calls: Mutex<Vec<String>>,
    /// Tool names advertised to each `stream` call, in call order.
    pub stream_tools: Mutex<Vec<Vec<String>>>,
}

impl FakeLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_completion(&self, text: &str) {
        self.completions.lock().unwrap().push_back(text.to_string());
    }

    pub fn push_structured(&self, value: Value) {
        self.structured.lock().unwrap().push_back(value);
    }

    pub fn push_stream(&self, events: Vec<StreamEvent>) {
        self.streams.lock().unwrap().push_back(events);
    }

    pub fn push_moderation(&self, flagged: bool, categories: &[&str]) {
        self.moderations.lock().unwrap().push_back(ModerationVerdict {
            flagged,
            categories: categories.iter().map(|c| c.to_string()).collect(),
        });
    }
}

#[async_trait]
impl LlmClient for FakeLlm {
    async fn complete(&self, _messages: Vec<Value>) -> Result<String> {
        match self.completions.lock().unwrap().pop_front() {
            Some(text) => Ok(text),
            None => bail!("FakeLlm: no completion scripted"),
        }
    }

    async fn complete_structured(
        &self,
        _messages: Vec<Value>,
        schema_name: &str,
        _schema: Value,
    ) -> Result<Value> {
        self.structured_calls
            .lock()
            .unwrap()
            .push(schema_name.to_string());
        match self.structured.lock().unwrap().pop_front() {
            Some(value) => Ok(value),
            None => bail!("FakeLlm: no structured output scripted for '{}'", schema_name),
        }
    }

    async fn stream(
        &self,
        _messages: Vec<Value>,
        tools: Vec<Value>,
    ) -> Result<mpsc::Receiver<Result<StreamEvent>>> {
        self.stream_tools.lock().unwrap().push(
            tools
                .iter()
                .filter_map(|tool| tool["function"]["name"].as_str().map(String::from))
                .collect(),
        );
        let events = match self.streams.lock().unwrap().pop_front() {
            Some(events) => events,
            None => bail!("FakeLlm: no stream scripted"),
        };
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for event in events {
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn moderate(&self, _text: &str) -> Result<ModerationVerdict> {
        Ok(self
            .moderations
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }
}

/// Captures every frame pushed to a client.
#[derive(Default)]
pub struct FakeTransport {
    pub sent: Mutex<Vec<(String, Value)>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_for(&self, uid: &str) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| u == uid)
            .map(|(_, frame)| frame.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, uid: &str, payload: Value) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((uid.to_string(), payload));
        Ok(())
    }
}

/// Plan generator returning a fixed plan and message.
pub struct FixedPlanGenerator {
    pub plan: Option<WeeklyPlan>,
    pub message: String,
}

impl FixedPlanGenerator {
    pub fn empty() -> Self {
        Self {
            plan: None,
            message: String::new(),
        }
    }

    pub fn with_plan(plan: WeeklyPlan, message: &str) -> Self {
        Self {
            plan: Some(plan),
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl PlanGenerator for FixedPlanGenerator {
    async fn generate_plan(
        &self,
        _uid: &str,
        _history: &[AnnotatedMessage],
        _memory: &str,
        _start_date: NaiveDate,
        _end_date: NaiveDate,
    ) -> Result<(Option<WeeklyPlan>, String)> {
        Ok((self.plan.clone(), self.message.clone()))
    }
}
