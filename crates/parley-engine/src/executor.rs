//! Step executor: runs one step and reports the actions it produced together
//! with the updated context.

use std::sync::Arc;

use chrono::Utc;
use parley_types::{Contact, Context, OutputAction, ParleyError, Result};
use serde_json::{Map, Value};

use crate::actions::{builtin_registry, ActionRegistry};
use crate::definition::FlowStep;
use crate::reply::PendingReply;
use crate::services::{ContactDirectory, Services};
use crate::step_config::{ActionListConfig, MessageSpec, StepConfig};
use crate::template::{render_lossy, resolve_value, Scope};

/// What a step produced.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub actions: Vec<OutputAction>,
    pub context: Context,
}

impl StepOutput {
    fn empty(context: Context) -> Self {
        Self {
            actions: Vec::new(),
            context,
        }
    }

    pub fn clears_state(&self) -> bool {
        self.actions.iter().any(|a| matches!(a, OutputAction::ClearState))
    }

    /// The first switch request, if any.
    pub fn switch_request(&self) -> Option<(&str, &Map<String, Value>)> {
        self.actions.iter().find_map(|a| match a {
            OutputAction::SwitchFlow {
                flow,
                initial_context,
            } => Some((flow.as_str(), initial_context)),
            _ => None,
        })
    }
}

pub struct StepExecutor {
    registry: Arc<ActionRegistry>,
    builtins: ActionRegistry,
    contacts: Arc<dyn ContactDirectory>,
}

fn push_message(
    actions: &mut Vec<OutputAction>,
    step: &str,
    spec: &MessageSpec,
    scope: &Scope<'_>,
) {
    let message = spec.render(scope);
    if message.is_empty() {
        tracing::debug!(step = %step, "Rendered message is empty, nothing sent");
    } else {
        actions.push(OutputAction::send(message));
    }
}

impl StepExecutor {
    /// `registry` holds caller-registered actions; they take precedence over
    /// the built-ins wired to `services`.
    pub fn new(registry: Arc<ActionRegistry>, services: &Services) -> Self {
        Self {
            registry,
            builtins: builtin_registry(services),
            contacts: services.contacts.clone(),
        }
    }

    /// Execute `step`. A step whose configuration does not parse is logged
    /// and produces nothing, leaving the context as it was.
    pub async fn execute(
        &self,
        step: &FlowStep,
        contact: &mut Contact,
        context: Context,
        suppress_prompt: bool,
    ) -> Result<StepOutput> {
        let config = match StepConfig::parse(step) {
            Ok(config) => config,
            Err(err) => {
                tracing::error!(step = %step.name, error = %err, "Invalid step configuration, step skipped");
                return Ok(StepOutput::empty(context));
            }
        };
        tracing::debug!(contact = %contact.id, step = %step.name, kind = %step.kind, "Executing step");

        let mut context = context;
        let mut actions = Vec::new();
        match config {
            StepConfig::SendMessage(cfg) => {
                let scope = Scope::new(&context).with_contact(contact);
                push_message(&mut actions, &step.name, &cfg.message, &scope);
            }
            StepConfig::Question(q) => {
                if !suppress_prompt {
                    if let Some(message) = &q.message {
                        let scope = Scope::new(&context).with_contact(contact);
                        push_message(&mut actions, &step.name, message, &scope);
                    }
                }
                PendingReply {
                    variable: q.variable.trim().to_string(),
                    expected: q.expected_reply,
                    pattern: q.validation_pattern.clone(),
                    step: step.name.clone(),
                }
                .write(&mut context);
            }
            StepConfig::ActionList(list) => {
                return self.run_actions(&step.name, &list, contact, context).await;
            }
            StepConfig::SwitchFlow(cfg) => {
                let scope = Scope::new(&context).with_contact(contact);
                let flow = render_lossy(&cfg.target_flow, &scope).trim().to_string();
                if flow.is_empty() {
                    return Err(ParleyError::lookup("flow", cfg.target_flow));
                }
                let initial_context =
                    match resolve_value(&Value::Object(cfg.initial_context.clone()), &scope) {
                        Value::Object(map) => map,
                        _ => Map::new(),
                    };
                actions.push(OutputAction::SwitchFlow {
                    flow,
                    initial_context,
                });
            }
            StepConfig::EndFlow(cfg) => {
                if let Some(message) = &cfg.message {
                    let scope = Scope::new(&context).with_contact(contact);
                    push_message(&mut actions, &step.name, message, &scope);
                }
                actions.push(OutputAction::ClearState);
            }
            StepConfig::HumanHandover(cfg) => {
                if !cfg.suppress_message {
                    if let Some(message) = &cfg.message {
                        let scope = Scope::new(&context).with_contact(contact);
                        push_message(&mut actions, &step.name, message, &scope);
                    }
                }
                let now = Utc::now();
                self.contacts.flag_human_intervention(&contact.id, now).await?;
                contact.needs_human_intervention = true;
                contact.intervention_requested_at = Some(now);
                tracing::info!(contact = %contact.id, step = %step.name, "Contact flagged for human intervention");
                actions.push(OutputAction::ClearState);
            }
        }

        Ok(StepOutput { actions, context })
    }

    async fn run_actions(
        &self,
        step: &str,
        list: &ActionListConfig,
        contact: &mut Contact,
        mut context: Context,
    ) -> Result<StepOutput> {
        let mut actions = Vec::new();
        for spec in &list.actions {
            let params = {
                let scope = Scope::new(&context).with_contact(contact);
                resolve_value(&spec.params, &scope)
            };
            let handler = self
                .registry
                .get(&spec.action)
                .or_else(|| self.builtins.get(&spec.action));
            let Some(handler) = handler else {
                tracing::warn!(step = %step, action = %spec.action, "Unhandled action");
                continue;
            };

            tracing::debug!(step = %step, action = %spec.action, "Running action");
            match handler.execute(contact, &mut context, &params).await {
                Ok(mut produced) => actions.append(&mut produced),
                Err(ParleyError::Configuration { message, .. }) => {
                    tracing::warn!(step = %step, action = %spec.action, error = %message, "Action skipped");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(StepOutput { actions, context })
    }
}
