//! Flow catalog: validated flows cached per engine, plus trigger matching.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parley_types::{Context, InboundEvent, ParleyError, Result};
use serde_json::Value;

use crate::definition::{Flow, FlowDefinition};
use crate::step_config::StepConfig;
use crate::validation::{validate_or_raise, Diagnostic, Severity};

/// A flow selected by an inbound event, with the context it starts with.
#[derive(Debug, Clone)]
pub struct TriggerMatch {
    pub flow: Arc<Flow>,
    pub initial_context: Context,
}

#[derive(Debug, Clone, Default)]
pub struct FlowCatalog {
    flows: BTreeMap<String, Arc<Flow>>,
}

impl FlowCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and add a flow, replacing any flow with the same name.
    /// Definitions with error diagnostics are refused; warnings are logged
    /// and returned.
    pub fn insert(&mut self, definition: FlowDefinition) -> Result<Vec<Diagnostic>> {
        let diagnostics = validate_or_raise(&definition)?;
        for d in &diagnostics {
            tracing::warn!(flow = %definition.name, rule = %d.rule, step = ?d.step, "{}", d.message);
        }
        let name = definition.name.clone();
        if self.flows.insert(name.clone(), Arc::new(Flow::new(definition))).is_some() {
            tracing::info!(flow = %name, "Flow definition replaced");
        } else {
            tracing::debug!(flow = %name, "Flow definition loaded");
        }
        Ok(diagnostics)
    }

    pub fn from_definitions(definitions: impl IntoIterator<Item = FlowDefinition>) -> Result<Self> {
        let mut catalog = Self::new();
        for definition in definitions {
            catalog.insert(definition)?;
        }
        Ok(catalog)
    }

    /// Load one flow object or an array of flows. Returns how many were added.
    pub fn load_str(&mut self, json: &str) -> Result<usize> {
        let definitions = FlowDefinition::parse_many(json)?;
        let count = definitions.len();
        for definition in definitions {
            self.insert(definition)?;
        }
        Ok(count)
    }

    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        self.load_str(&raw).map_err(|err| match err {
            ParleyError::DefinitionInvalid(msg) => {
                ParleyError::DefinitionInvalid(format!("{}: {msg}", path.display()))
            }
            ParleyError::Json(e) => {
                ParleyError::DefinitionInvalid(format!("{}: {e}", path.display()))
            }
            other => other,
        })
    }

    /// Load every `*.json` file in `dir`, in file name order.
    pub fn load_dir(&mut self, dir: impl AsRef<Path>) -> Result<usize> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir.as_ref())? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut count = 0;
        for path in paths {
            count += self.load_file(&path)?;
        }
        tracing::info!(dir = %dir.as_ref().display(), flows = count, "Flow directory loaded");
        Ok(count)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Flow>> {
        self.flows.get(name).cloned()
    }

    pub fn require(&self, name: &str) -> Result<Arc<Flow>> {
        self.get(name).ok_or_else(|| ParleyError::lookup("flow", name))
    }

    pub fn names(&self) -> Vec<&str> {
        self.flows.keys().map(String::as_str).collect()
    }

    pub fn flows(&self) -> impl Iterator<Item = &Arc<Flow>> {
        self.flows.values()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Cross-flow checks: literal switch targets must name a loaded flow.
    pub fn validate_links(&self) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        for flow in self.flows.values() {
            for step in flow.steps() {
                let mut targets = Vec::new();
                match StepConfig::parse(step) {
                    Ok(StepConfig::SwitchFlow(cfg)) => targets.extend(cfg.static_target().map(String::from)),
                    Ok(StepConfig::Question(q)) => {
                        if let Some(action) = q.on_exhausted {
                            if let Ok(StepConfig::SwitchFlow(cfg)) =
                                StepConfig::from_parts(&step.name, action.kind, &action.config)
                            {
                                targets.extend(cfg.static_target().map(String::from));
                            }
                        }
                    }
                    _ => {}
                }
                for target in targets.into_iter().filter(|t| !self.flows.contains_key(t)) {
                    diagnostics.push(Diagnostic {
                        rule: "switch_target_exists".into(),
                        severity: Severity::Warning,
                        message: format!(
                            "Step '{}.{}' switches to unknown flow '{target}'",
                            flow.name(),
                            step.name
                        ),
                        step: Some(step.name.clone()),
                        fix: Some(format!("Load flow '{target}' or fix target_flow")),
                    });
                }
            }
        }
        diagnostics
    }

    /// Find the flow an event starts. Keywords are checked first, against the
    /// message text and the chosen reply id; then trigger patterns against the
    /// text. Inactive flows and internal events never match.
    pub fn match_trigger(&self, event: &InboundEvent) -> Option<TriggerMatch> {
        if event.is_internal() {
            return None;
        }
        let text = event.text_body().trim().to_lowercase();
        let reply_id = event
            .reply_id
            .as_deref()
            .map(|id| id.trim().to_lowercase())
            .unwrap_or_default();
        let active = || self.flows.values().filter(|f| f.is_active());

        let keyword_hit = active().find(|flow| {
            flow.definition().trigger_keywords.iter().any(|keyword| {
                let keyword = keyword.trim().to_lowercase();
                !keyword.is_empty() && (keyword == text || keyword == reply_id)
            })
        });
        if let Some(flow) = keyword_hit {
            tracing::debug!(flow = %flow.name(), "Trigger keyword matched");
            return Some(TriggerMatch {
                flow: flow.clone(),
                initial_context: Context::new(),
            });
        }

        let text = event.text_body().trim();
        if text.is_empty() {
            return None;
        }
        for flow in active() {
            let Some(regex) = flow.trigger_regex() else {
                continue;
            };
            let Some(captures) = regex.captures(text) else {
                continue;
            };
            let mut initial_context = Context::new();
            if let Some(variable) = flow.definition().capture_variable.as_deref() {
                let captured = captures.get(1).or_else(|| captures.get(0));
                if let Some(m) = captured {
                    initial_context.set(variable, Value::String(m.as_str().to_string()));
                }
            }
            tracing::debug!(flow = %flow.name(), "Trigger pattern matched");
            return Some(TriggerMatch {
                flow: flow.clone(),
                initial_context,
            });
        }
        None
    }
}
