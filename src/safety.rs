//! Two-sided safety filter.
//!
//! Input side: the moderation endpoint screens user messages before any
//! generation happens. Output side: five independent category classifiers
//! review the fully buffered draft in parallel; if any fires, a single-pass
//! streamed revision replaces the draft.

use std::sync::Arc;

use anyhow::Result;
use futures_util::future::try_join_all;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::llm::{
    self, object_schema, system_message, LlmClient, ModerationVerdict, StreamEvent,
};
use crate::messages::AnnotatedMessage;
use crate::prompts;

pub const HARM_CATEGORIES: [(&str, &str); 5] = [
    (
        "bodily harm",
        "Advice that could physically hurt the user: overtraining, exercising \
         through injury, unsafe technique, or ignoring medical guidance.",
    ),
    (
        "body image",
        "Content that ties exercise to appearance, weight shame, or comparison \
         with other people's bodies.",
    ),
    (
        "mental health",
        "Content that dismisses, diagnoses, or mishandles signs of mental \
         distress instead of encouraging appropriate support.",
    ),
    (
        "negative mindset",
        "Content that scolds, guilt-trips, or frames missed workouts as personal \
         failure.",
    ),
    (
        "out of scope",
        "Content far outside physical-activity coaching: medical, legal, or \
         financial advice, or unrelated topics presented as coaching.",
    ),
];

#[derive(Debug, Deserialize)]
struct HarmVerdict {
    rationale: String,
    harmful: bool,
}

/// Outcome of the parallel output review.
#[derive(Debug, Clone)]
pub struct OutputReview {
    /// One verdict per entry of [`HARM_CATEGORIES`], in order.
    pub category_hits: Vec<bool>,
    pub rationales: Vec<String>,
}

impl OutputReview {
    pub fn harmful(&self) -> bool {
        self.category_hits.iter().any(|hit| *hit)
    }

    pub fn flagged_category_names(&self) -> Vec<String> {
        HARM_CATEGORIES
            .iter()
            .zip(&self.category_hits)
            .filter(|(_, hit)| **hit)
            .map(|((name, _), _)| name.to_string())
            .collect()
    }
}

#[derive(Clone)]
pub struct SafetyFilter {
    llm: Arc<dyn LlmClient>,
}

impl SafetyFilter {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn moderate_user_input(&self, text: &str) -> Result<ModerationVerdict> {
        self.llm.moderate(text).await
    }

    /// Runs the five category classifiers concurrently over the buffered
    /// draft. Any single classifier failure fails the review; the caller
    /// aborts the turn rather than shipping an unreviewed draft.
    pub async fn review_output(
        &self,
        user_input: &str,
        model_output: &str,
    ) -> Result<OutputReview> {
        let checks = HARM_CATEGORIES.iter().map(|(name, description)| {
            let llm = Arc::clone(&self.llm);
            async move {
                let verdict: HarmVerdict = llm::structured(
                    llm.as_ref(),
                    vec![system_message(prompts::harm_classifier_prompt(
                        name,
                        description,
                        user_input,
                        model_output,
                    ))],
                    "harm_verdict",
                    harm_schema(),
                )
                .await?;
                Ok::<HarmVerdict, anyhow::Error>(verdict)
            }
        });

        let verdicts = try_join_all(checks).await?;
        Ok(OutputReview {
            category_hits: verdicts.iter().map(|v| v.harmful).collect(),
            rationales: verdicts.into_iter().map(|v| v.rationale).collect(),
        })
    }

    /// Streams a single-pass rewrite of a flagged draft. The revision is not
    /// re-reviewed.
    pub async fn revise_output(
        &self,
        history: &[AnnotatedMessage],
        user_input: &str,
        original_output: &str,
        review: &OutputReview,
    ) -> Result<mpsc::Receiver<Result<StreamEvent>>> {
        let categories = review.flagged_category_names().join(", ");
        let rationales = HARM_CATEGORIES
            .iter()
            .zip(&review.category_hits)
            .zip(&review.rationales)
            .filter(|((_, hit), _)| **hit)
            .map(|(((name, _), _), rationale)| format!("- {}: {}", name, rationale))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = prompts::revision_prompt(
            &prompts::render_history(history),
            user_input,
            original_output,
            &categories,
            &rationales,
        );
        self.llm.stream(vec![system_message(prompt)], Vec::new()).await
    }
}

fn harm_schema() -> serde_json::Value {
    object_schema(json!({
        "rationale": {"type": "string"},
        "harmful": {"type": "boolean"},
    }))
}
