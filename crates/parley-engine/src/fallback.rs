//! Fallback policy for question steps whose transitions all failed.
//!
//! Each question keeps a counter under `_retry_counts.<step>`:
//! `Idle -> Retrying(n) -> Exhausted`. While the budget lasts the contact is
//! re-prompted; once it is spent the step's `on_exhausted` action runs, or the
//! conversation is handed to a human.

use parley_types::Context;
use serde_json::{json, Map, Value};

use crate::config::EngineConfig;
use crate::definition::{FlowStep, StepKind};
use crate::step_config::{ExhaustedAction, MessageSpec, StepConfig};

pub const RETRY_COUNTS_KEY: &str = "_retry_counts";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Idle,
    Retrying(u32),
    Exhausted,
}

impl RetryState {
    pub fn from_count(count: u32, max_retries: u32) -> Self {
        if count >= max_retries {
            RetryState::Exhausted
        } else if count == 0 {
            RetryState::Idle
        } else {
            RetryState::Retrying(count)
        }
    }
}

pub fn retry_count(context: &Context, step: &str) -> u32 {
    context
        .get(RETRY_COUNTS_KEY)
        .and_then(|counts| counts.get(step))
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0)
}

pub fn set_retry_count(context: &mut Context, step: &str, count: u32) {
    let mut counts = match context.remove(RETRY_COUNTS_KEY) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    counts.insert(step.to_string(), json!(count));
    context.set(RETRY_COUNTS_KEY, Value::Object(counts));
}

/// Forget the counter for `step`; the map itself goes once empty.
pub fn reset_retry_count(context: &mut Context, step: &str) {
    let Some(Value::Object(mut counts)) = context.remove(RETRY_COUNTS_KEY) else {
        return;
    };
    counts.remove(step);
    if !counts.is_empty() {
        context.set(RETRY_COUNTS_KEY, Value::Object(counts));
    }
}

/// What to do about a question that got no matching transition.
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackDecision {
    /// Send `message`, bump the counter to `attempt`, ask again.
    Reprompt { attempt: u32, message: MessageSpec },
    /// Run the configured terminal action.
    Exhausted(ExhaustedAction),
    /// Hand over to a human with `message`.
    Handover { message: String },
}

#[derive(Debug, Clone)]
pub struct FallbackPolicy {
    default_max_retries: u32,
    default_retry_message: String,
    exhausted_message: String,
}

impl FallbackPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            default_max_retries: config.default_max_retries,
            default_retry_message: config.default_retry_message.clone(),
            exhausted_message: config.exhausted_message.clone(),
        }
    }

    pub fn decide(&self, step: &FlowStep, context: &Context) -> FallbackDecision {
        let question = match StepConfig::parse(step) {
            Ok(StepConfig::Question(q)) => q,
            _ => {
                return FallbackDecision::Handover {
                    message: self.exhausted_message.clone(),
                }
            }
        };

        let count = retry_count(context, &step.name);
        let max = question.max_retries.unwrap_or(self.default_max_retries);
        match RetryState::from_count(count, max) {
            RetryState::Exhausted => match question.on_exhausted {
                Some(action) => FallbackDecision::Exhausted(action),
                None => FallbackDecision::Handover {
                    message: self.exhausted_message.clone(),
                },
            },
            RetryState::Idle | RetryState::Retrying(_) => FallbackDecision::Reprompt {
                attempt: count + 1,
                message: question
                    .retry_message
                    .unwrap_or_else(|| MessageSpec::text(self.default_retry_message.clone())),
            },
        }
    }
}

/// A one-off human handover step carrying `message`.
pub fn handover_step(name: impl Into<String>, message: &str) -> FlowStep {
    FlowStep::new(name, StepKind::HumanHandover, json!({ "message": message }))
}
