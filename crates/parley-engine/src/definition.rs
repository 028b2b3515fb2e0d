use std::borrow::Cow;
use std::collections::HashMap;

use parley_types::{ParleyError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The closed set of step kinds a flow may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    SendMessage,
    Question,
    ActionList,
    SwitchFlow,
    EndFlow,
    HumanHandover,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::SendMessage => "send_message",
            StepKind::Question => "question",
            StepKind::ActionList => "action_list",
            StepKind::SwitchFlow => "switch_flow",
            StepKind::EndFlow => "end_flow",
            StepKind::HumanHandover => "human_handover",
        }
    }

    /// Kinds that leave the flow instead of advancing inside it.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepKind::SwitchFlow | StepKind::EndFlow | StepKind::HumanHandover
        )
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowTransition {
    pub next_step: String,
    #[serde(default)]
    pub priority: i32,
    /// Tagged condition descriptor; absent means always true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStep {
    pub name: String,
    pub kind: StepKind,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub is_entry_point: bool,
    #[serde(default)]
    pub transitions: Vec<FlowTransition>,
}

impl FlowStep {
    pub fn new(name: impl Into<String>, kind: StepKind, config: Value) -> Self {
        Self {
            name: name.into(),
            kind,
            config,
            is_entry_point: false,
            transitions: Vec::new(),
        }
    }

    pub fn entry(mut self) -> Self {
        self.is_entry_point = true;
        self
    }

    pub fn then(mut self, next_step: impl Into<String>, priority: i32, condition: Option<Value>) -> Self {
        self.transitions.push(FlowTransition {
            next_step: next_step.into(),
            priority,
            condition,
        });
        self
    }
}

fn default_active() -> bool {
    true
}

/// Serialized form of a flow, as authored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub trigger_keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_variable: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub steps: Vec<FlowStep>,
}

impl FlowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            trigger_keywords: Vec::new(),
            trigger_pattern: None,
            capture_variable: None,
            active: true,
            steps: Vec::new(),
        }
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trigger_keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_step(mut self, step: FlowStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Parse a JSON document holding either one flow object or an array of flows.
    pub fn parse_many(json: &str) -> Result<Vec<FlowDefinition>> {
        let value: Value = serde_json::from_str(json)?;
        match value {
            Value::Array(_) => Ok(serde_json::from_value(value)?),
            Value::Object(_) => Ok(vec![serde_json::from_value(value)?]),
            other => Err(ParleyError::DefinitionInvalid(format!(
                "expected a flow object or an array of flows, got {other}"
            ))),
        }
    }
}

// --- Indexed flow ---

/// Regexes compiled once per flow, keyed by their source text: transition
/// `reply_matches_pattern` conditions and question `validation_pattern`s.
#[derive(Debug, Clone, Default)]
pub struct Patterns {
    compiled: HashMap<String, Regex>,
}

impl Patterns {
    fn collect(steps: &[FlowStep]) -> Self {
        let mut compiled = HashMap::new();
        let mut add = |pattern: &str| {
            if compiled.contains_key(pattern) {
                return;
            }
            if let Ok(re) = Regex::new(pattern) {
                compiled.insert(pattern.to_string(), re);
            }
        };
        for step in steps {
            if step.kind == StepKind::Question {
                if let Some(p) = step.config.get("validation_pattern").and_then(Value::as_str) {
                    add(p);
                }
            }
            for t in &step.transitions {
                let Some(condition) = t.condition.as_ref() else {
                    continue;
                };
                if condition.get("kind").and_then(Value::as_str) == Some("reply_matches_pattern") {
                    if let Some(p) = condition.get("pattern").and_then(Value::as_str) {
                        add(p);
                    }
                }
            }
        }
        Self { compiled }
    }

    pub fn get(&self, pattern: &str) -> Option<&Regex> {
        self.compiled.get(pattern)
    }

    /// The cached regex, or a fresh compile for patterns this flow never declared.
    pub fn compile(&self, pattern: &str) -> std::result::Result<Cow<'_, Regex>, regex::Error> {
        match self.compiled.get(pattern) {
            Some(re) => Ok(Cow::Borrowed(re)),
            None => Regex::new(pattern).map(Cow::Owned),
        }
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}

/// A flow definition indexed for execution: steps by name, transitions in
/// evaluation order, compiled trigger and reply patterns.
#[derive(Debug, Clone)]
pub struct Flow {
    definition: FlowDefinition,
    index: HashMap<String, usize>,
    trigger_regex: Option<Regex>,
    patterns: Patterns,
}

impl Flow {
    /// Index a definition. Semantic problems (duplicate names, missing entry
    /// point, bad pattern) are left to the validator; the first step with a
    /// given name wins.
    pub fn new(mut definition: FlowDefinition) -> Self {
        let mut index = HashMap::new();
        for (i, step) in definition.steps.iter_mut().enumerate() {
            // Stable: equal priorities keep declaration order.
            step.transitions.sort_by_key(|t| t.priority);
            index.entry(step.name.clone()).or_insert(i);
        }

        let trigger_regex = definition
            .trigger_pattern
            .as_deref()
            .and_then(|p| Regex::new(&format!("(?i){p}")).ok());

        let patterns = Patterns::collect(&definition.steps);

        Self {
            definition,
            index,
            trigger_regex,
            patterns,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &FlowDefinition {
        &self.definition
    }

    pub fn is_active(&self) -> bool {
        self.definition.active
    }

    /// The first step flagged as entry point.
    pub fn entry_step(&self) -> Option<&FlowStep> {
        self.definition.steps.iter().find(|s| s.is_entry_point)
    }

    pub fn step(&self, name: &str) -> Option<&FlowStep> {
        self.index.get(name).map(|&i| &self.definition.steps[i])
    }

    /// Like [`Flow::step`], but a missing step is a lookup error.
    pub fn require_step(&self, name: &str) -> Result<&FlowStep> {
        self.step(name)
            .ok_or_else(|| ParleyError::lookup("step", format!("{}.{}", self.name(), name)))
    }

    /// Outgoing transitions of a step, sorted by priority.
    pub fn outgoing(&self, step: &str) -> &[FlowTransition] {
        match self.step(step) {
            Some(s) => &s.transitions,
            None => &[],
        }
    }

    pub fn steps(&self) -> &[FlowStep] {
        &self.definition.steps
    }

    pub fn trigger_regex(&self) -> Option<&Regex> {
        self.trigger_regex.as_ref()
    }

    pub fn patterns(&self) -> &Patterns {
        &self.patterns
    }
}

impl From<FlowDefinition> for Flow {
    fn from(definition: FlowDefinition) -> Self {
        Flow::new(definition)
    }
}
