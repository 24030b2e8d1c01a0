//! Prompt assembly.
//!
//! All model-facing text lives here so the pipeline and classifier modules
//! stay free of string literals. Functions return finished prompt strings;
//! callers wrap them in chat-completion messages.

use crate::messages::{AnnotatedMessage, Role};

pub const PERSONA: &str = "You are Beebo, a warm and encouraging physical-activity coach. \
You help people build sustainable exercise habits through conversation. \
You keep replies short (two to four sentences), ask one question at a time, \
and never lecture. You only discuss physical activity, weekly workout plans, \
and closely related wellbeing topics.";

/// Fixed greeting for a brand-new onboarding session.
pub const ONBOARDING_INTRO: &str = "Hello, it's wonderful to meet you! I'm Beebo, \
your personal activity coach. I'm here to help you build a weekly movement plan \
that actually fits your life. To start off, how would you describe your \
relationship with physical activity these days?";

/// Canned reply sent instead of generating when input moderation fires.
pub const HARMFUL_INPUT_RESPONSE: &str = "I'm sorry, but I can't help with that. \
I'm here to support you with physical activity and your weekly plan. If you're \
going through a difficult time, please consider reaching out to someone you \
trust or a professional who can help.";

/// Opener queued when a finished onboarding graduates to check-in mode.
pub const CHECK_IN_INVITE: &str = "Your first week with your plan is underway! \
Whenever you're ready, let's check in on how it's going.";

/// Task prompt used for every open-chat turn (no dialogue-state graph).
pub const OPEN_CHAT_TASK: &str = "Continue the conversation naturally. Answer the \
user's question or comment, relate it back to their weekly activity plan when \
relevant, and keep the exchange brief and friendly.";

fn mode_context(mode_blurb: &str) -> String {
    format!("{}\n\n{}", PERSONA, mode_blurb)
}

pub fn onboarding_context() -> String {
    mode_context(
        "This is the user's first conversation with you. Your goal is to get to \
         know their activity history, help them set a realistic weekly goal, and \
         build their first weekly plan together.",
    )
}

pub fn check_in_context() -> String {
    mode_context(
        "This is a weekly check-in. Review how the past week's plan went, \
         celebrate what worked, explore what got in the way, and agree on next \
         week's plan together.",
    )
}

pub fn open_chat_context() -> String {
    mode_context(
        "This is an open conversation the user started themselves. Be responsive \
         to whatever they bring up, within your coaching role.",
    )
}

/// Full system prompt: persona + mode context + live user context blocks.
pub fn system_prompt(
    mode_blurb: &str,
    local_time: &str,
    plan_history: &str,
    ambient_history: &str,
    memory: &str,
) -> String {
    let mut prompt = format!("{}\n\nThe user's current local time is {}.", mode_blurb, local_time);
    if !plan_history.is_empty() {
        prompt.push_str(&format!("\n\nWeekly plan history:\n{}", plan_history));
    }
    if !ambient_history.is_empty() {
        prompt.push_str(&format!(
            "\n\nRecent activity shared with the user:\n{}",
            ambient_history
        ));
    }
    if !memory.is_empty() {
        prompt.push_str(&format!(
            "\n\nSummaries of previous conversations:\n{}",
            memory
        ));
    }
    prompt
}

/// Assistant-role steering message appended after the user turn in
/// state-driven modes.
pub fn task_steering(task: &str, strategy_name: &str, strategy_text: &str) -> String {
    format!(
        "My current task: {}\n\nI will respond using the '{}' strategy: {}",
        task, strategy_name, strategy_text
    )
}

/// Flattens a history into `role: content` lines for classifier prompts.
pub fn render_history(history: &[AnnotatedMessage]) -> String {
    history
        .iter()
        .filter(|m| !m.hidden && matches!(m.role, Role::User | Role::Assistant))
        .map(|m| {
            let role = match m.role {
                Role::User => "user",
                _ => "assistant",
            };
            format!("{}: {}", role, m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Prompt for the two-way dialogue-state transition classifier.
pub fn transition_classifier_prompt(history_text: &str, task_prompt: &str) -> String {
    format!(
        "You are analyzing a coaching conversation to decide whether the current \
         conversational task is finished.\n\nCurrent task: {}\n\nConversation so \
         far:\n{}\n\nDecide whether the task is 'completed' or should 'continue'. \
         Explain your reasoning briefly, then give the decision.",
        task_prompt, history_text
    )
}

/// Prompt for the motivational-interviewing strategy classifier.
pub fn strategy_classifier_prompt(history_text: &str, task_prompt: &str) -> String {
    format!(
        "You are choosing the best motivational-interviewing strategy for a \
         coach's next reply.\n\nThe coach's current task: {}\n\nConversation so \
         far:\n{}\n\nPick the single strategy that best fits the coach's next \
         turn.",
        task_prompt, history_text
    )
}

/// Prompt for one output-harmfulness category classifier.
pub fn harm_classifier_prompt(
    category_name: &str,
    category_description: &str,
    user_input: &str,
    model_output: &str,
) -> String {
    format!(
        "You are reviewing a health coach's draft reply for potential harm in one \
         specific category.\n\nCategory: {}\n{}\n\nUser message:\n{}\n\nDraft \
         reply:\n{}\n\nDecide whether the draft reply is harmful in this category. \
         Give a short rationale, then the verdict.",
        category_name, category_description, user_input, model_output
    )
}

/// System prompt for the single-pass revision of a flagged draft.
pub fn revision_prompt(
    history_text: &str,
    user_input: &str,
    original_output: &str,
    categories: &str,
    rationales: &str,
) -> String {
    format!(
        "{}\n\nA draft reply you wrote was flagged as potentially harmful and must \
         be rewritten.\n\nConversation so far:\n{}\n\nUser message:\n{}\n\nFlagged \
         draft:\n{}\n\nFlagged categories: {}\nReviewer rationales:\n{}\n\nWrite a \
         replacement reply that addresses the user supportively without the \
         flagged content. Do not mention that a draft was flagged or rewritten.",
        PERSONA, history_text, user_input, original_output, categories, rationales
    )
}

/// Prompt for the session summarizer.
pub fn summary_prompt(history_text: &str) -> String {
    format!(
        "Summarize this coaching conversation for the coach's future reference.\n\n\
         Conversation:\n{}\n\nProduce a headline of at most 50 characters and a \
         longer summary covering the user's situation, their goals, any plan \
         changes, and commitments made.",
        history_text
    )
}

/// Intro-generation task for a resumed or scheduled session.
pub fn intro_task(mode_blurb: &str) -> String {
    format!(
        "{}\n\nOpen the conversation with a short, warm greeting that reflects \
         what you know about the user from the context above, and invite them to \
         respond. Do not ask more than one question.",
        mode_blurb
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MessageKind;

    #[test]
    fn render_history_skips_tool_and_hidden_turns() {
        let mut hidden = AnnotatedMessage::new(MessageKind::Message, Role::Assistant, "secret");
        hidden.hidden = true;
        let tool = AnnotatedMessage::new(MessageKind::Message, Role::Tool, "{}");
        let user = AnnotatedMessage::new(MessageKind::Message, Role::User, "hi");
        let assistant = AnnotatedMessage::new(MessageKind::Message, Role::Assistant, "hello");

        let text = render_history(&[hidden, tool, user, assistant]);
        assert_eq!(text, "user: hi\nassistant: hello");
    }

    #[test]
    fn system_prompt_omits_empty_context_blocks() {
        let prompt = system_prompt(&open_chat_context(), "Monday 9am", "", "", "");
        assert!(!prompt.contains("Weekly plan history"));
        assert!(!prompt.contains("Summaries of previous conversations"));
        assert!(prompt.contains("Monday 9am"));
    }
}
