//! Transition conditions: tagged JSON descriptors and their evaluator.
//!
//! ```text
//! {"kind": "reply_text_equals", "value": "yes", "case_sensitive": false}
//! {"kind": "context_variable_exists", "variable": "order.id"}
//! {"kind": "always_true"}
//! ```
//!
//! Evaluation is pure over the contact, the triggering event and the context.

use parley_types::{
    lookup_path, value_to_string, Contact, Context, EventKind, InboundEvent, ParleyError, Result,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::definition::Patterns;
use crate::reply::PendingReply;
use crate::template::{render_lossy, Scope};

pub const LAST_FORM_RESPONSE_KEY: &str = "_last_form_response";

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    AlwaysTrue,
    ReplyTextEquals {
        value: String,
        #[serde(default)]
        case_sensitive: bool,
    },
    ReplyTextContains {
        value: String,
        #[serde(default)]
        case_sensitive: bool,
    },
    ReplyMatchesPattern {
        pattern: String,
    },
    ChosenReplyIdEquals {
        value: String,
    },
    EventKindIs {
        value: EventKind,
    },
    ContextVariableEquals {
        variable: String,
        value: Value,
    },
    ContextVariableExists {
        variable: String,
    },
    ContextVariableContains {
        variable: String,
        value: Value,
    },
    StructuredFormFieldEquals {
        path: String,
        value: Value,
    },
    PendingReplyWasValid {
        #[serde(default = "default_true")]
        expected: bool,
    },
    UserRequestedHuman {
        #[serde(default)]
        keywords: Option<Vec<String>>,
    },
    ContactIsPrivileged,
}

fn decode(step: &str, descriptor: Option<&Value>) -> Result<Condition> {
    let descriptor = match descriptor {
        None | Some(Value::Null) => return Ok(Condition::AlwaysTrue),
        Some(d) => d,
    };
    serde_json::from_value(descriptor.clone()).map_err(|e| ParleyError::Configuration {
        step: step.to_string(),
        message: format!("invalid condition {descriptor}: {e}"),
    })
}

/// Parse a transition's condition descriptor and check its pattern compiles.
/// Absent or `null` is always true.
pub fn parse_condition(step: &str, descriptor: Option<&Value>) -> Result<Condition> {
    let condition = decode(step, descriptor)?;
    if let Condition::ReplyMatchesPattern { pattern } = &condition {
        Regex::new(pattern).map_err(|e| ParleyError::Configuration {
            step: step.to_string(),
            message: format!("invalid condition pattern: {e}"),
        })?;
    }
    Ok(condition)
}

fn text_matches(actual: &str, expected: &str, case_sensitive: bool, contains: bool) -> bool {
    let (actual, expected) = if case_sensitive {
        (actual.to_string(), expected.to_string())
    } else {
        (actual.to_lowercase(), expected.to_lowercase())
    };
    if contains {
        actual.contains(&expected)
    } else {
        actual.trim() == expected.trim()
    }
}

/// Evaluates conditions. Holds the default keyword set for
/// `user_requested_human`.
#[derive(Debug, Clone, Default)]
pub struct ConditionEvaluator {
    human_keywords: Vec<String>,
}

impl ConditionEvaluator {
    pub fn new(human_keywords: Vec<String>) -> Self {
        Self { human_keywords }
    }

    /// Parse and evaluate. Malformed descriptors are logged and evaluate to false.
    pub fn evaluate_descriptor(
        &self,
        step: &str,
        descriptor: Option<&Value>,
        patterns: &Patterns,
        contact: &Contact,
        event: &InboundEvent,
        context: &Context,
    ) -> bool {
        match decode(step, descriptor) {
            Ok(condition) => self.evaluate(&condition, patterns, contact, event, context),
            Err(err) => {
                tracing::warn!(step = %step, error = %err, "Malformed condition evaluates to false");
                false
            }
        }
    }

    pub fn evaluate(
        &self,
        condition: &Condition,
        patterns: &Patterns,
        contact: &Contact,
        event: &InboundEvent,
        context: &Context,
    ) -> bool {
        let scope = Scope::new(context).with_contact(contact);
        let text = event.text_body();

        match condition {
            Condition::AlwaysTrue => true,
            Condition::ReplyTextEquals {
                value,
                case_sensitive,
            } => text_matches(text, value, *case_sensitive, false),
            Condition::ReplyTextContains {
                value,
                case_sensitive,
            } => text_matches(text, value, *case_sensitive, true),
            Condition::ReplyMatchesPattern { pattern } => match patterns.compile(pattern) {
                Ok(re) => re.is_match(text),
                Err(err) => {
                    tracing::warn!(pattern = %pattern, error = %err, "Invalid condition pattern");
                    false
                }
            },
            Condition::ChosenReplyIdEquals { value } => event.reply_id.as_deref() == Some(value.as_str()),
            Condition::EventKindIs { value } => event.kind == *value,
            Condition::ContextVariableEquals { variable, value } => {
                let expected = value_to_string(value);
                match scope.lookup(variable) {
                    None | Some(Value::Null) => expected.is_empty(),
                    Some(actual) => value_to_string(&actual) == expected,
                }
            }
            Condition::ContextVariableExists { variable } => {
                let path = render_lossy(variable, &scope);
                scope.lookup(&path).is_some_and(|v| !v.is_null())
            }
            Condition::ContextVariableContains { variable, value } => {
                let expected = value_to_string(value);
                match scope.lookup(variable) {
                    Some(Value::Array(items)) => items.iter().any(|i| value_to_string(i) == expected),
                    Some(Value::String(s)) => s.contains(&expected),
                    _ => false,
                }
            }
            Condition::StructuredFormFieldEquals { path, value } => {
                let form = event
                    .form
                    .as_ref()
                    .filter(|f| !f.is_null())
                    .or_else(|| context.get(LAST_FORM_RESPONSE_KEY));
                form.and_then(|f| lookup_path(f, path))
                    .is_some_and(|actual| value_to_string(actual) == value_to_string(value))
            }
            Condition::PendingReplyWasValid { expected } => {
                !PendingReply::is_pending(context) == *expected
            }
            Condition::UserRequestedHuman { keywords } => {
                let keywords = keywords.as_ref().unwrap_or(&self.human_keywords);
                let lowered = text.to_lowercase();
                keywords
                    .iter()
                    .map(|k| k.trim().to_lowercase())
                    .any(|k| !k.is_empty() && lowered.contains(&k))
            }
            Condition::ContactIsPrivileged => contact.is_privileged(),
        }
    }
}
