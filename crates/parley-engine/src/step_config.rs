//! Typed, per-kind step configuration parsed from the JSON `config` blob.

use parley_types::{value_to_string, MessageKind, OutboundMessage, ParleyError, Result};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::definition::{FlowStep, StepKind};
use crate::reply::ExpectedReply;
use crate::template::{render_lossy, resolve_value, Scope};

fn default_message_kind() -> MessageKind {
    MessageKind::Text
}

/// A message as authored: a bare string is a text message, an object is
/// `{kind, ...payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageSpec {
    Text(String),
    Rich {
        #[serde(default = "default_message_kind")]
        kind: MessageKind,
        #[serde(flatten)]
        payload: Map<String, Value>,
    },
}

impl MessageSpec {
    pub fn text(body: impl Into<String>) -> Self {
        MessageSpec::Text(body.into())
    }

    /// Render the payload against `scope`.
    pub fn render(&self, scope: &Scope<'_>) -> OutboundMessage {
        match self {
            MessageSpec::Text(body) => OutboundMessage::text(render_lossy(body, scope)),
            MessageSpec::Rich { kind, payload } => {
                let mut payload = resolve_value(&Value::Object(payload.clone()), scope);
                if *kind == MessageKind::Text {
                    if let Some(body) = payload.get_mut("body") {
                        if !body.is_string() && !body.is_null() {
                            *body = Value::String(value_to_string(body));
                        }
                    }
                }
                OutboundMessage {
                    kind: *kind,
                    payload,
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessageConfig {
    pub message: MessageSpec,
}

/// One-off terminal step run when a question's retries are exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExhaustedAction {
    pub kind: StepKind,
    #[serde(default)]
    pub config: Value,
}

impl ExhaustedAction {
    /// Synthetic step for the executor, named after the question it belongs to.
    pub fn to_step(&self, question: &str) -> FlowStep {
        FlowStep::new(format!("{question}:on_exhausted"), self.kind, self.config.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageSpec>,
    pub variable: String,
    #[serde(default)]
    pub expected_reply: ExpectedReply,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_message: Option<MessageSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_exhausted: Option<ExhaustedAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub action: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionListConfig {
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchFlowConfig {
    pub target_flow: String,
    #[serde(default)]
    pub initial_context: Map<String, Value>,
}

impl SwitchFlowConfig {
    /// The target when it is a literal name rather than a template.
    pub fn static_target(&self) -> Option<&str> {
        let target = self.target_flow.trim();
        (!target.contains("{{") && !target.contains("{%")).then_some(target)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndFlowConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandoverConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageSpec>,
    #[serde(default)]
    pub suppress_message: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepConfig {
    SendMessage(SendMessageConfig),
    Question(QuestionConfig),
    ActionList(ActionListConfig),
    SwitchFlow(SwitchFlowConfig),
    EndFlow(EndFlowConfig),
    HumanHandover(HandoverConfig),
}

fn config_error(step: &str, message: impl Into<String>) -> ParleyError {
    ParleyError::Configuration {
        step: step.to_string(),
        message: message.into(),
    }
}

fn decode<T: DeserializeOwned>(step: &str, kind: StepKind, raw: Value) -> Result<T> {
    serde_json::from_value(raw).map_err(|e| config_error(step, format!("invalid {kind} config: {e}")))
}

impl StepConfig {
    pub fn parse(step: &FlowStep) -> Result<Self> {
        Self::from_parts(&step.name, step.kind, &step.config)
    }

    pub fn from_parts(step: &str, kind: StepKind, raw: &Value) -> Result<Self> {
        let raw = match raw {
            Value::Null => Value::Object(Map::new()),
            other => other.clone(),
        };

        let config = match kind {
            StepKind::SendMessage => StepConfig::SendMessage(decode(step, kind, raw)?),
            StepKind::Question => {
                let question: QuestionConfig = decode(step, kind, raw)?;
                check_question(step, &question)?;
                StepConfig::Question(question)
            }
            StepKind::ActionList => {
                let list: ActionListConfig = decode(step, kind, raw)?;
                if let Some(i) = list.actions.iter().position(|a| a.action.trim().is_empty()) {
                    return Err(config_error(step, format!("action #{i} has no name")));
                }
                StepConfig::ActionList(list)
            }
            StepKind::SwitchFlow => {
                let switch: SwitchFlowConfig = decode(step, kind, raw)?;
                if switch.target_flow.trim().is_empty() {
                    return Err(config_error(step, "target_flow must not be empty"));
                }
                StepConfig::SwitchFlow(switch)
            }
            StepKind::EndFlow => StepConfig::EndFlow(decode(step, kind, raw)?),
            StepKind::HumanHandover => StepConfig::HumanHandover(decode(step, kind, raw)?),
        };
        Ok(config)
    }

    pub fn kind(&self) -> StepKind {
        match self {
            StepConfig::SendMessage(_) => StepKind::SendMessage,
            StepConfig::Question(_) => StepKind::Question,
            StepConfig::ActionList(_) => StepKind::ActionList,
            StepConfig::SwitchFlow(_) => StepKind::SwitchFlow,
            StepConfig::EndFlow(_) => StepKind::EndFlow,
            StepConfig::HumanHandover(_) => StepKind::HumanHandover,
        }
    }
}

fn check_question(step: &str, question: &QuestionConfig) -> Result<()> {
    let variable = question.variable.trim();
    if variable.is_empty() {
        return Err(config_error(step, "question variable must not be empty"));
    }
    if variable.starts_with('_') {
        return Err(config_error(
            step,
            format!("variable '{variable}' uses the reserved '_' prefix"),
        ));
    }
    if let Some(pattern) = &question.validation_pattern {
        Regex::new(pattern)
            .map_err(|e| config_error(step, format!("invalid validation_pattern: {e}")))?;
    }
    if let Some(exhausted) = &question.on_exhausted {
        if !exhausted.kind.is_terminal() {
            return Err(config_error(
                step,
                format!("on_exhausted kind must be terminal, got {}", exhausted.kind),
            ));
        }
        StepConfig::from_parts(step, exhausted.kind, &exhausted.config)?;
    }
    Ok(())
}
