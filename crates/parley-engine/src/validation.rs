//! Flow validation: lint rules and diagnostics.
//!
//! Provides 9 built-in rules that check structural and semantic correctness of
//! a [`FlowDefinition`]. Call [`validate`] for advisory diagnostics or
//! [`validate_or_raise`] to fail on any `Error`-severity issue.

use std::collections::{HashMap, HashSet, VecDeque};

use parley_types::{ParleyError, Result};
use regex::Regex;

use crate::condition::parse_condition;
use crate::definition::{FlowDefinition, StepKind};
use crate::step_config::StepConfig;
use crate::template;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub step: Option<String>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let level = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{level}[{}]: {}", self.rule, self.message)?;
        if let Some(fix) = &self.fix {
            write!(f, " (fix: {fix})")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, flow: &FlowDefinition) -> Vec<Diagnostic>;
}

fn diag(
    rule: &dyn LintRule,
    severity: Severity,
    step: Option<&str>,
    message: String,
    fix: impl Into<String>,
) -> Diagnostic {
    Diagnostic {
        rule: rule.name().into(),
        severity,
        message,
        step: step.map(str::to_string),
        fix: Some(fix.into()),
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct EntryPointRule;
impl LintRule for EntryPointRule {
    fn name(&self) -> &str { "entry_point" }
    fn apply(&self, flow: &FlowDefinition) -> Vec<Diagnostic> {
        let entries: Vec<_> = flow.steps.iter().filter(|s| s.is_entry_point).collect();
        match entries.len() {
            1 => vec![],
            0 => vec![diag(
                self,
                Severity::Error,
                None,
                format!("Flow '{}' has no entry step", flow.name),
                "Set is_entry_point on exactly one step",
            )],
            n => vec![diag(
                self,
                Severity::Error,
                None,
                format!(
                    "Flow '{}' has {n} entry steps: {}; expected exactly one",
                    flow.name,
                    entries.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join(", ")
                ),
                "Clear is_entry_point on the extra steps",
            )],
        }
    }
}

struct UniqueStepNamesRule;
impl LintRule for UniqueStepNamesRule {
    fn name(&self) -> &str { "unique_step_names" }
    fn apply(&self, flow: &FlowDefinition) -> Vec<Diagnostic> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for step in &flow.steps {
            *counts.entry(step.name.as_str()).or_default() += 1;
        }
        let mut dupes: Vec<_> = counts.into_iter().filter(|(_, n)| *n > 1).collect();
        dupes.sort();
        dupes
            .into_iter()
            .map(|(name, n)| {
                diag(
                    self,
                    Severity::Error,
                    Some(name),
                    format!("Step name '{name}' is used {n} times"),
                    "Give every step a distinct name",
                )
            })
            .collect()
    }
}

struct TransitionTargetExistsRule;
impl LintRule for TransitionTargetExistsRule {
    fn name(&self) -> &str { "transition_target_exists" }
    fn apply(&self, flow: &FlowDefinition) -> Vec<Diagnostic> {
        let names: HashSet<&str> = flow.steps.iter().map(|s| s.name.as_str()).collect();
        flow.steps
            .iter()
            .flat_map(|s| s.transitions.iter().map(move |t| (s, t)))
            .filter(|(_, t)| !names.contains(t.next_step.as_str()))
            .map(|(s, t)| {
                diag(
                    self,
                    Severity::Error,
                    Some(&s.name),
                    format!(
                        "Transition {} -> {} references non-existent step '{}'",
                        s.name, t.next_step, t.next_step
                    ),
                    format!("Add step '{}' or fix the transition target", t.next_step),
                )
            })
            .collect()
    }
}

struct StepConfigValidRule;
impl LintRule for StepConfigValidRule {
    fn name(&self) -> &str { "step_config_valid" }
    fn apply(&self, flow: &FlowDefinition) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for step in &flow.steps {
            if let Err(err) = StepConfig::parse(step) {
                diags.push(diag(
                    self,
                    Severity::Error,
                    Some(&step.name),
                    format!("Step '{}' has invalid {} config: {err}", step.name, step.kind),
                    format!("Fix the config of '{}'", step.name),
                ));
            }
            if let Err(err) = template::check_value(&step.config) {
                diags.push(diag(
                    self,
                    Severity::Error,
                    Some(&step.name),
                    format!("Step '{}' has an invalid template: {err}", step.name),
                    "Close every {{ }} and {% if %} block",
                ));
            }
        }
        diags
    }
}

struct ConditionSyntaxRule;
impl LintRule for ConditionSyntaxRule {
    fn name(&self) -> &str { "condition_syntax" }
    fn apply(&self, flow: &FlowDefinition) -> Vec<Diagnostic> {
        flow.steps
            .iter()
            .flat_map(|s| s.transitions.iter().map(move |t| (s, t)))
            .filter_map(|(s, t)| {
                let err = parse_condition(&s.name, t.condition.as_ref()).err()?;
                Some(diag(
                    self,
                    Severity::Error,
                    Some(&s.name),
                    format!("Transition {} -> {} has an invalid condition: {err}", s.name, t.next_step),
                    "Use a {\"kind\": ...} descriptor with the fields its kind needs",
                ))
            })
            .collect()
    }
}

struct TriggerPatternValidRule;
impl LintRule for TriggerPatternValidRule {
    fn name(&self) -> &str { "trigger_pattern_valid" }
    fn apply(&self, flow: &FlowDefinition) -> Vec<Diagnostic> {
        let Some(pattern) = flow.trigger_pattern.as_deref() else {
            return vec![];
        };
        match Regex::new(&format!("(?i){pattern}")) {
            Ok(_) => vec![],
            Err(err) => vec![diag(
                self,
                Severity::Error,
                None,
                format!("Flow '{}' has an invalid trigger pattern '{pattern}': {err}", flow.name),
                "Fix the regular expression",
            )],
        }
    }
}

struct ReachabilityRule;
impl LintRule for ReachabilityRule {
    fn name(&self) -> &str { "reachability" }
    fn apply(&self, flow: &FlowDefinition) -> Vec<Diagnostic> {
        let Some(entry) = flow.steps.iter().find(|s| s.is_entry_point) else {
            return vec![]; // EntryPointRule reports this
        };

        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(entry.name.as_str());
        queue.push_back(entry);

        while let Some(current) = queue.pop_front() {
            for t in &current.transitions {
                if visited.insert(t.next_step.as_str()) {
                    if let Some(next) = flow.steps.iter().find(|s| s.name == t.next_step) {
                        queue.push_back(next);
                    }
                }
            }
        }

        flow.steps
            .iter()
            .filter(|s| !visited.contains(s.name.as_str()))
            .map(|s| {
                diag(
                    self,
                    Severity::Warning,
                    Some(&s.name),
                    format!("Step '{}' is not reachable from the entry step", s.name),
                    format!("Add a transition leading to '{}' or remove it", s.name),
                )
            })
            .collect()
    }
}

struct DeadEndRule;
impl LintRule for DeadEndRule {
    fn name(&self) -> &str { "dead_end" }
    fn apply(&self, flow: &FlowDefinition) -> Vec<Diagnostic> {
        flow.steps
            .iter()
            .filter(|s| !s.kind.is_terminal() && s.kind != StepKind::Question)
            .filter(|s| s.transitions.is_empty())
            .map(|s| {
                diag(
                    self,
                    Severity::Warning,
                    Some(&s.name),
                    format!(
                        "Step '{}' ({}) has no transitions; the conversation will be handed to a human there",
                        s.name, s.kind
                    ),
                    "Add a transition or finish with an end_flow step",
                )
            })
            .collect()
    }
}

struct TriggerPresentRule;
impl LintRule for TriggerPresentRule {
    fn name(&self) -> &str { "trigger_present" }
    fn apply(&self, flow: &FlowDefinition) -> Vec<Diagnostic> {
        let has_keyword = flow.trigger_keywords.iter().any(|k| !k.trim().is_empty());
        if flow.active && !has_keyword && flow.trigger_pattern.is_none() {
            vec![diag(
                self,
                Severity::Warning,
                None,
                format!("Active flow '{}' has no trigger; it can only be entered by a switch", flow.name),
                "Add trigger_keywords or a trigger_pattern",
            )]
        } else {
            vec![]
        }
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
pub fn validate(flow: &FlowDefinition) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(EntryPointRule),
        Box::new(UniqueStepNamesRule),
        Box::new(TransitionTargetExistsRule),
        Box::new(StepConfigValidRule),
        Box::new(ConditionSyntaxRule),
        Box::new(TriggerPatternValidRule),
        Box::new(ReachabilityRule),
        Box::new(DeadEndRule),
        Box::new(TriggerPresentRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(flow));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(flow: &FlowDefinition) -> Result<Vec<Diagnostic>> {
    let diagnostics = validate(flow);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.message.clone())
        .collect();
    if !errors.is_empty() {
        return Err(ParleyError::DefinitionInvalid(format!(
            "flow '{}': {}",
            flow.name,
            errors.join("; ")
        )));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::FlowStep;
    use serde_json::json;

    fn flow(value: serde_json::Value) -> FlowDefinition {
        serde_json::from_value(value).unwrap()
    }

    fn has(diags: &[Diagnostic], rule: &str, severity: Severity) -> bool {
        diags.iter().any(|d| d.rule == rule && d.severity == severity)
    }

    fn valid_flow() -> FlowDefinition {
        flow(json!({
            "name": "survey",
            "trigger_keywords": ["survey"],
            "steps": [
                {"name": "ask", "kind": "question", "is_entry_point": true,
                 "config": {"message": "Rate us 1-5", "variable": "score", "expected_reply": "number"},
                 "transitions": [{"next_step": "thanks",
                                  "condition": {"kind": "pending_reply_was_valid"}}]},
                {"name": "thanks", "kind": "end_flow", "config": {"message": "Thanks {{ profile.first_name }}"}}
            ]
        }))
    }

    #[test]
    fn valid_flow_passes() {
        let diags = validate(&valid_flow());
        assert!(diags.is_empty(), "Expected no diagnostics, got: {diags:?}");
        assert!(validate_or_raise(&valid_flow()).is_ok());
    }

    #[test]
    fn missing_and_duplicate_entry_points() {
        let mut f = valid_flow();
        f.steps[0].is_entry_point = false;
        assert!(has(&validate(&f), "entry_point", Severity::Error));

        f.steps[0].is_entry_point = true;
        f.steps[1].is_entry_point = true;
        let diags = validate(&f);
        assert!(diags.iter().any(|d| d.rule == "entry_point" && d.message.contains("2 entry steps")));
    }

    #[test]
    fn duplicate_step_names() {
        let mut f = valid_flow();
        let mut copy = f.steps[1].clone();
        copy.is_entry_point = false;
        f.steps.push(copy);
        let diags = validate(&f);
        assert!(diags
            .iter()
            .any(|d| d.rule == "unique_step_names" && d.step.as_deref() == Some("thanks")));
    }

    #[test]
    fn missing_transition_target() {
        let mut f = valid_flow();
        f.steps[0].transitions[0].next_step = "nowhere".into();
        let diags = validate(&f);
        assert!(has(&diags, "transition_target_exists", Severity::Error));
        assert!(validate_or_raise(&f).is_err());
    }

    #[test]
    fn invalid_step_config_and_template() {
        let f = flow(json!({
            "name": "broken",
            "trigger_keywords": ["x"],
            "steps": [
                {"name": "a", "kind": "question", "is_entry_point": true, "config": {"message": "no var"},
                 "transitions": [{"next_step": "b"}]},
                {"name": "b", "kind": "send_message", "config": {"message": "Hi {{ name"},
                 "transitions": [{"next_step": "c"}]},
                {"name": "c", "kind": "end_flow"}
            ]
        }));
        let diags = validate(&f);
        let bad: Vec<_> = diags
            .iter()
            .filter(|d| d.rule == "step_config_valid")
            .filter_map(|d| d.step.as_deref())
            .collect();
        assert_eq!(bad, vec!["a", "b"]);
    }

    #[test]
    fn invalid_condition_and_trigger_pattern() {
        let mut f = valid_flow();
        f.steps[0].transitions[0].condition = Some(json!({"kind": "reply_matches_pattern", "pattern": "("}));
        f.trigger_pattern = Some("[unclosed".into());
        let diags = validate(&f);
        assert!(has(&diags, "condition_syntax", Severity::Error));
        assert!(has(&diags, "trigger_pattern_valid", Severity::Error));

        let err = validate_or_raise(&f).unwrap_err();
        assert!(matches!(err, ParleyError::DefinitionInvalid(ref m) if m.starts_with("flow 'survey'")));
    }

    #[test]
    fn unreachable_and_dead_end_are_warnings() {
        let mut f = valid_flow();
        f.steps.push(FlowStep::new("orphan", StepKind::SendMessage, json!({"message": "hi"})));
        let diags = validate(&f);
        assert!(diags
            .iter()
            .any(|d| d.rule == "reachability" && d.severity == Severity::Warning && d.message.contains("orphan")));
        assert!(diags
            .iter()
            .any(|d| d.rule == "dead_end" && d.step.as_deref() == Some("orphan")));
        assert!(validate_or_raise(&f).is_ok());
    }

    #[test]
    fn trigger_presence_only_for_active_flows() {
        let mut f = valid_flow();
        f.trigger_keywords.clear();
        assert!(has(&validate(&f), "trigger_present", Severity::Warning));
        f.active = false;
        assert!(!has(&validate(&f), "trigger_present", Severity::Warning));
    }

    #[test]
    fn diagnostic_display() {
        let mut f = valid_flow();
        f.trigger_keywords.clear();
        let d = validate(&f).remove(0);
        let text = d.to_string();
        assert!(text.starts_with("warning[trigger_present]"));
        assert!(text.contains("fix:"));
    }
}
