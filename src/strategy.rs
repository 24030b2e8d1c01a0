//! Motivational-interviewing strategy selection.
//!
//! Before each assistant turn a classifier picks one strategy from a closed
//! vocabulary; the chosen strategy steers generation and is recorded on the
//! message for later analysis.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;

use crate::llm::{self, object_schema, system_message, LlmClient};
use crate::messages::AnnotatedMessage;
use crate::prompts;

pub const STRATEGIES: [(&str, &str); 11] = [
    (
        "Advise with Permission",
        "Give advice only after asking whether the user wants it, or when they asked directly.",
    ),
    (
        "Affirm",
        "Say something positive and genuine about the user's efforts, strengths, or intentions.",
    ),
    (
        "Emphasize Control",
        "Remind the user that choices about their activity are theirs to make.",
    ),
    (
        "Facilitate",
        "Use simple encouragers that keep the user talking, like 'tell me more'.",
    ),
    (
        "Filler",
        "Small conversational glue: greetings, pleasantries, and closings.",
    ),
    (
        "Giving Information",
        "Share factual information, explain something, or give feedback without judging.",
    ),
    (
        "Question",
        "Ask an open question that invites the user to explore their situation.",
    ),
    (
        "Reflect",
        "Mirror back what the user said to show understanding, without adding judgment.",
    ),
    (
        "Reframe",
        "Offer a new, more constructive meaning for something the user described.",
    ),
    (
        "Support",
        "Express compassion or agreement in a way that sides with the user.",
    ),
    (
        "Structure",
        "Explain what is happening next in the conversation or in the program.",
    ),
];

#[derive(Debug, Deserialize)]
struct StrategyChoice {
    strategy: String,
}

#[derive(Clone)]
pub struct StrategySelector;

impl StrategySelector {
    pub fn new() -> Self {
        Self
    }

    pub fn strategy_text(name: &str) -> Option<&'static str> {
        STRATEGIES
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, text)| *text)
    }

    /// Picks the strategy for the next assistant turn.
    pub async fn predict(
        &self,
        llm: &dyn LlmClient,
        history: &[AnnotatedMessage],
        task_prompt: &str,
    ) -> Result<(String, &'static str)> {
        let history_text = prompts::render_history(history);
        let choice: StrategyChoice = llm::structured(
            llm,
            vec![system_message(prompts::strategy_classifier_prompt(
                &history_text,
                task_prompt,
            ))],
            "strategy_choice",
            strategy_schema(),
        )
        .await?;

        let text = Self::strategy_text(&choice.strategy)
            .with_context(|| format!("Classifier returned unknown strategy '{}'", choice.strategy))?;
        Ok((choice.strategy, text))
    }
}

fn strategy_schema() -> serde_json::Value {
    let names: Vec<&str> = STRATEGIES.iter().map(|(name, _)| *name).collect();
    object_schema(json!({
        "strategy": {"type": "string", "enum": names},
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeLlm;

    #[tokio::test]
    async fn predict_returns_name_and_static_text() {
        let llm = FakeLlm::new();
        llm.push_structured(json!({"strategy": "Reflect"}));
        let selector = StrategySelector::new();
        let (name, text) = selector.predict(&llm, &[], "review the week").await.unwrap();
        assert_eq!(name, "Reflect");
        assert_eq!(text, StrategySelector::strategy_text("Reflect").unwrap());
    }

    #[tokio::test]
    async fn unknown_strategy_is_an_error() {
        let llm = FakeLlm::new();
        llm.push_structured(json!({"strategy": "Hypnotize"}));
        let selector = StrategySelector::new();
        assert!(selector.predict(&llm, &[], "task").await.is_err());
    }

    #[test]
    fn schema_offers_the_full_closed_vocabulary() {
        let schema = strategy_schema();
        let names = schema["properties"]["strategy"]["enum"].as_array().unwrap();
        assert_eq!(names.len(), STRATEGIES.len());
    }
}
