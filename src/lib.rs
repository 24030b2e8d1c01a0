//! Beebo: a conversational physical-activity coaching backend.
//!
//! Clients connect over a WebSocket in one of three chat modes (onboarding,
//! weekly check-in, open chat). Turns run through a single pipeline that
//! resolves dialogue state, moderates input, selects a coaching strategy,
//! generates a reply with tool support, and reviews the output before it is
//! streamed back.

pub mod config;
pub mod dialogue;
pub mod llm;
pub mod memory;
pub mod messages;
pub mod notify;
pub mod pipeline;
pub mod plan;
pub mod prompts;
pub mod safety;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod store;
pub mod strategy;
pub mod tools;
pub mod transport;

#[cfg(test)]
pub mod test_support;
