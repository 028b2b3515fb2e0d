//! Conversation engine: the per-contact loop controller.
//!
//! [`FlowEngine::process_event`] takes one inbound event through a cycle:
//!
//! ```text
//! lock contact -> drop duplicates -> load contact
//!   no state : match trigger -> create state at entry -> enter entry step
//!   state    : validate reply -> select transition -> enter next step
//!   enter    : execute -> commit | switch flow | clear state
//!              non-question steps fall through with an internal event
//!   no match : question -> fallback policy, otherwise human handover
//! ```
//!
//! Every commit carries the version it read. A stale write surfaces as a
//! conflict: the cycle stops and only output of steps already committed is
//! delivered.

use std::sync::Arc;

use parley_types::{
    Contact, ContactFlowState, Context, InboundEvent, OutboundMessage, OutputAction, ParleyError,
    Result,
};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::actions::ActionRegistry;
use crate::catalog::FlowCatalog;
use crate::condition::{ConditionEvaluator, LAST_FORM_RESPONSE_KEY};
use crate::config::EngineConfig;
use crate::definition::{Flow, FlowStep, StepKind};
use crate::events::{EngineEvent, EventEmitter};
use crate::executor::StepExecutor;
use crate::fallback::{
    handover_step, reset_retry_count, set_retry_count, FallbackDecision, FallbackPolicy,
};
use crate::locks::{ContactLocks, RecentEvents};
use crate::reply::{validate_reply, PendingReply};
use crate::services::Services;
use crate::store::TransitionResult;
use crate::template::Scope;
use crate::transition::select_transition;

/// Id of the last external event a state consumed.
pub const LAST_EVENT_ID_KEY: &str = "_last_event_id";

// ---------------------------------------------------------------------------
// FlowEngine
// ---------------------------------------------------------------------------

/// Drives conversations for every contact. Share it behind an `Arc`; cycles
/// for one contact are serialised, different contacts run in parallel.
pub struct FlowEngine {
    catalog: Arc<FlowCatalog>,
    pub(crate) services: Services,
    pub(crate) config: EngineConfig,
    executor: StepExecutor,
    evaluator: ConditionEvaluator,
    fallback: FallbackPolicy,
    pub(crate) locks: ContactLocks,
    recent: RecentEvents,
    pub(crate) events: EventEmitter,
}

impl FlowEngine {
    pub fn new(
        catalog: FlowCatalog,
        services: Services,
        registry: ActionRegistry,
        config: EngineConfig,
    ) -> Self {
        for d in catalog.validate_links() {
            tracing::warn!(rule = %d.rule, step = ?d.step, "{}", d.message);
        }
        tracing::info!(
            flows = catalog.len(),
            actions = registry.len(),
            "Flow engine ready"
        );
        Self {
            executor: StepExecutor::new(Arc::new(registry), &services),
            evaluator: ConditionEvaluator::new(config.human_keywords.clone()),
            fallback: FallbackPolicy::from_config(&config),
            locks: ContactLocks::new(),
            recent: RecentEvents::new(config.recent_event_capacity),
            events: EventEmitter::new(config.event_buffer),
            catalog: Arc::new(catalog),
            services,
            config,
        }
    }

    /// Engine with only the built-in actions and default configuration.
    pub fn with_defaults(catalog: FlowCatalog, services: Services) -> Self {
        Self::new(catalog, services, ActionRegistry::new(), EngineConfig::default())
    }

    pub fn catalog(&self) -> &FlowCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Run one cycle for `contact_id`. Messages are handed to the dispatcher
    /// in order; the returned list holds the messages and, if the flow ended,
    /// a trailing `ClearState`.
    pub async fn process_event(&self, contact_id: &str, event: InboundEvent) -> Vec<OutputAction> {
        let guard = self.locks.acquire(contact_id).await;
        let actions = self.run_locked(contact_id, event).await;
        drop(guard);
        self.locks.release(contact_id);
        actions
    }

    async fn run_locked(&self, contact_id: &str, event: InboundEvent) -> Vec<OutputAction> {
        if let Some(id) = event.id.as_deref() {
            if !self.recent.record(id) {
                tracing::debug!(contact = %contact_id, event_id = %id, "Duplicate event dropped");
                return Vec::new();
            }
        }

        let contact = match self.services.contacts.load_contact(contact_id).await {
            Ok(Some(contact)) => contact,
            Ok(None) => {
                tracing::warn!(contact = %contact_id, "Unknown contact, event ignored");
                return Vec::new();
            }
            Err(err) => {
                tracing::error!(contact = %contact_id, error = %err, "Failed to load contact");
                return Vec::new();
            }
        };

        let event_id = event.id.clone();
        let mut cycle = Cycle::new(self, contact, event);
        let outcome = cycle.run().await;
        let actions = match outcome {
            Ok(()) => cycle.output,
            Err(err) if err.is_conflict() => {
                tracing::warn!(contact = %contact_id, kept = cycle.output.len(), "State changed by another writer, cycle stopped");
                // Committed steps are covered by the state's event stamp.
                if let Some(id) = event_id.as_deref() {
                    self.recent.forget(id);
                }
                cycle.output
            }
            Err(err) if err.escalates_to_human() => cycle.escalate(err).await,
            Err(err) => self.fail(contact_id, err).await,
        };

        self.dispatch(contact_id, &actions).await;
        actions
    }

    /// Unexpected failure: forget the conversation and apologise once.
    async fn fail(&self, contact_id: &str, err: ParleyError) -> Vec<OutputAction> {
        tracing::error!(contact = %contact_id, error = %err, "Cycle failed, clearing state");
        if let Err(clear_err) = self.services.store.clear_state(contact_id).await {
            tracing::error!(contact = %contact_id, error = %clear_err, "Failed to clear state");
        }
        self.events.emit(EngineEvent::CycleFailed {
            contact: contact_id.to_string(),
            error: err.to_string(),
        });
        vec![OutputAction::send(OutboundMessage::text(
            self.config.apology_message.clone(),
        ))]
    }

    pub(crate) async fn dispatch(&self, contact_id: &str, actions: &[OutputAction]) {
        for message in actions.iter().filter_map(OutputAction::message) {
            if let Err(err) = self
                .services
                .dispatcher
                .enqueue_outbound(contact_id, message)
                .await
            {
                tracing::error!(contact = %contact_id, error = %err, "Failed to enqueue outbound message");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Cycle
// ---------------------------------------------------------------------------

enum Next {
    /// Execute `step` and move the state onto it.
    Enter {
        flow: Arc<Flow>,
        state: ContactFlowState,
        step: FlowStep,
        context: Context,
    },
    /// Pick a transition out of the state's current step.
    Evaluate {
        flow: Arc<Flow>,
        state: ContactFlowState,
    },
    Stop,
}

struct Cycle<'a> {
    engine: &'a FlowEngine,
    contact: Contact,
    inbound: InboundEvent,
    internal: InboundEvent,
    /// Set once the inbound event has been used; later steps see `internal`.
    consumed: bool,
    flow: Option<String>,
    steps: usize,
    output: Vec<OutputAction>,
}

impl<'a> Cycle<'a> {
    fn new(engine: &'a FlowEngine, contact: Contact, inbound: InboundEvent) -> Self {
        Self {
            engine,
            contact,
            inbound,
            internal: InboundEvent::internal(),
            consumed: false,
            flow: None,
            steps: 0,
            output: Vec::new(),
        }
    }

    fn event(&self) -> &InboundEvent {
        if self.consumed {
            &self.internal
        } else {
            &self.inbound
        }
    }

    fn stamp(&self, context: &mut Context) {
        if let Some(id) = &self.inbound.id {
            context.set(LAST_EVENT_ID_KEY, Value::String(id.clone()));
        }
    }

    fn is_replay(&self, state: &ContactFlowState) -> bool {
        match &self.inbound.id {
            Some(id) => state.context.get(LAST_EVENT_ID_KEY).and_then(Value::as_str) == Some(id.as_str()),
            None => false,
        }
    }

    fn committed(&self, result: TransitionResult) -> Result<ContactFlowState> {
        result.committed().ok_or_else(|| ParleyError::Conflict {
            contact: self.contact.id.clone(),
        })
    }

    fn push(&mut self, actions: Vec<OutputAction>) {
        self.output.extend(
            actions
                .into_iter()
                .filter(|a| !matches!(a, OutputAction::SwitchFlow { .. })),
        );
    }

    async fn run(&mut self) -> Result<()> {
        let engine = self.engine;
        let mut next = match engine.services.store.load_state(&self.contact.id).await? {
            Some(state) => {
                if self.is_replay(&state) {
                    tracing::debug!(contact = %self.contact.id, "Event already consumed by this state");
                    return Ok(());
                }
                self.flow = Some(state.flow.clone());
                let flow = engine.catalog.require(&state.flow)?;
                Next::Evaluate { flow, state }
            }
            None => match self.trigger().await? {
                Some(next) => next,
                None => return Ok(()),
            },
        };

        loop {
            next = match next {
                Next::Stop => return Ok(()),
                Next::Enter {
                    flow,
                    state,
                    step,
                    context,
                } => self.enter(flow, state, step, context).await?,
                Next::Evaluate { flow, state } => self.evaluate(flow, state).await?,
            };
        }
    }

    async fn trigger(&mut self) -> Result<Option<Next>> {
        let engine = self.engine;
        let Some(hit) = engine.catalog.match_trigger(&self.inbound) else {
            tracing::debug!(contact = %self.contact.id, "No flow triggered");
            return Ok(None);
        };
        let flow = hit.flow;
        self.flow = Some(flow.name().to_string());
        let entry = flow
            .entry_step()
            .cloned()
            .ok_or_else(|| ParleyError::lookup("entry step", flow.name()))?;

        let mut context = hit.initial_context;
        self.stamp(&mut context);
        let state = engine
            .services
            .store
            .create_state(&self.contact.id, flow.name(), &entry.name, context.clone())
            .await?;

        tracing::info!(contact = %self.contact.id, flow = %flow.name(), "Flow triggered");
        engine.events.emit(EngineEvent::FlowTriggered {
            contact: self.contact.id.clone(),
            flow: flow.name().to_string(),
        });
        Ok(Some(Next::Enter {
            flow,
            state,
            step: entry,
            context,
        }))
    }

    async fn enter(
        &mut self,
        flow: Arc<Flow>,
        state: ContactFlowState,
        step: FlowStep,
        context: Context,
    ) -> Result<Next> {
        let engine = self.engine;
        self.steps += 1;
        if self.steps > engine.config.max_steps_per_cycle {
            return Err(ParleyError::IterationBudgetExceeded {
                flow: flow.name().to_string(),
                limit: engine.config.max_steps_per_cycle,
            });
        }
        self.consumed = true;
        self.flow = Some(flow.name().to_string());

        tracing::debug!(contact = %self.contact.id, flow = %flow.name(), step = %step.name, kind = %step.kind, "Entering step");
        engine.events.emit(EngineEvent::StepEntered {
            contact: self.contact.id.clone(),
            flow: flow.name().to_string(),
            step: step.name.clone(),
            kind: step.kind.to_string(),
        });

        let out = engine
            .executor
            .execute(&step, &mut self.contact, context, false)
            .await?;

        if out.clears_state() {
            engine.services.store.clear_state(&self.contact.id).await?;
            if step.kind == StepKind::HumanHandover {
                engine.events.emit(EngineEvent::HumanHandover {
                    contact: self.contact.id.clone(),
                    flow: flow.name().to_string(),
                    reason: format!("step '{}'", step.name),
                });
            }
            tracing::info!(contact = %self.contact.id, flow = %flow.name(), step = %step.name, "Flow ended");
            engine.events.emit(EngineEvent::StateCleared {
                contact: self.contact.id.clone(),
                flow: flow.name().to_string(),
            });
            self.push(out.actions);
            return Ok(Next::Stop);
        }

        let switch = out
            .switch_request()
            .map(|(target, initial)| (target.to_string(), initial.clone()));
        if let Some((target, initial)) = switch {
            let target = engine.catalog.require(&target)?;
            let entry = target
                .entry_step()
                .cloned()
                .ok_or_else(|| ParleyError::lookup("entry step", target.name()))?;
            let mut context = Context::from_map(initial);
            self.stamp(&mut context);
            let switched = engine
                .services
                .store
                .switch_flow(state.id, state.version, target.name(), &entry.name, context.clone())
                .await?;
            let state = self.committed(switched)?;

            tracing::info!(contact = %self.contact.id, from = %flow.name(), to = %target.name(), "Flow switched");
            engine.events.emit(EngineEvent::FlowSwitched {
                contact: self.contact.id.clone(),
                from_flow: flow.name().to_string(),
                to_flow: target.name().to_string(),
            });
            self.push(out.actions);
            return Ok(Next::Enter {
                flow: target,
                state,
                step: entry,
                context,
            });
        }

        let mut context = out.context;
        self.stamp(&mut context);
        let result = engine
            .services
            .store
            .atomic_transition(state.id, state.version, &step.name, context)
            .await?;
        let state = self.committed(result)?;
        self.push(out.actions);

        if step.kind == StepKind::Question {
            Ok(Next::Stop)
        } else {
            Ok(Next::Evaluate { flow, state })
        }
    }

    async fn evaluate(&mut self, flow: Arc<Flow>, held: ContactFlowState) -> Result<Next> {
        let engine = self.engine;
        let state = match engine.services.store.load_state(&self.contact.id).await? {
            Some(state) if state.id == held.id && state.flow == held.flow => state,
            _ => {
                tracing::info!(contact = %self.contact.id, flow = %flow.name(), "State cleared or replaced during the cycle, stopping");
                return Ok(Next::Stop);
            }
        };
        let step = flow.require_step(&state.step)?.clone();
        let event = self.event().clone();
        let genuine = !event.is_internal();
        let mut context = state.context.clone();

        if genuine {
            if let Some(form) = &event.form {
                context.set(LAST_FORM_RESPONSE_KEY, form.clone());
            }
        }

        if genuine && step.kind == StepKind::Question {
            if let Some(marker) = PendingReply::read(&context) {
                match validate_reply(&marker, flow.patterns(), &event) {
                    Ok(value) => {
                        context.set_path(&marker.variable, value);
                        PendingReply::clear(&mut context);
                        reset_retry_count(&mut context, &step.name);
                        tracing::debug!(contact = %self.contact.id, step = %step.name, variable = %marker.variable, "Reply accepted");
                        engine.events.emit(EngineEvent::ReplyAccepted {
                            contact: self.contact.id.clone(),
                            step: step.name.clone(),
                            variable: marker.variable.clone(),
                        });
                    }
                    Err(ParleyError::ReplyRejected { reason, .. }) => {
                        tracing::debug!(contact = %self.contact.id, step = %step.name, reason = %reason, "Reply rejected");
                        engine.events.emit(EngineEvent::ReplyRejected {
                            contact: self.contact.id.clone(),
                            step: step.name.clone(),
                            reason,
                        });
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        self.consumed = true;

        let chosen = select_transition(
            &flow,
            &step.name,
            &engine.evaluator,
            &self.contact,
            &event,
            &context,
        )
        .map(|t| t.next_step.clone());

        match chosen {
            Some(next) => {
                let next_step = flow.require_step(&next)?.clone();
                if step.kind == StepKind::Question {
                    PendingReply::clear(&mut context);
                    reset_retry_count(&mut context, &step.name);
                }
                Ok(Next::Enter {
                    flow,
                    state,
                    step: next_step,
                    context,
                })
            }
            None if step.kind == StepKind::Question => {
                self.fall_back(flow, state, step, context).await
            }
            None => {
                tracing::error!(contact = %self.contact.id, flow = %flow.name(), step = %step.name, "No transition matched");
                Err(ParleyError::Structural {
                    flow: flow.name().to_string(),
                    step: step.name,
                })
            }
        }
    }

    async fn fall_back(
        &mut self,
        flow: Arc<Flow>,
        state: ContactFlowState,
        step: FlowStep,
        mut context: Context,
    ) -> Result<Next> {
        let engine = self.engine;
        match engine.fallback.decide(&step, &context) {
            FallbackDecision::Reprompt { attempt, message } => {
                tracing::info!(contact = %self.contact.id, step = %step.name, attempt, "Reply not understood, asking again");
                engine.events.emit(EngineEvent::FallbackEngaged {
                    contact: self.contact.id.clone(),
                    step: step.name.clone(),
                    attempt,
                });

                let retry = message.render(&Scope::new(&context).with_contact(&self.contact));
                set_retry_count(&mut context, &step.name, attempt);
                let out = engine
                    .executor
                    .execute(&step, &mut self.contact, context, false)
                    .await?;
                let mut context = out.context;
                self.stamp(&mut context);
                let result = engine
                    .services
                    .store
                    .atomic_transition(state.id, state.version, &step.name, context)
                    .await?;
                self.committed(result)?;

                if !retry.is_empty() {
                    self.output.push(OutputAction::send(retry));
                }
                self.push(out.actions);
                Ok(Next::Stop)
            }
            FallbackDecision::Exhausted(action) => {
                tracing::warn!(contact = %self.contact.id, step = %step.name, action = %action.kind, "Retries exhausted");
                PendingReply::clear(&mut context);
                reset_retry_count(&mut context, &step.name);
                Ok(Next::Enter {
                    flow,
                    state,
                    step: action.to_step(&step.name),
                    context,
                })
            }
            FallbackDecision::Handover { message } => {
                tracing::warn!(contact = %self.contact.id, step = %step.name, "Retries exhausted, handing over");
                PendingReply::clear(&mut context);
                reset_retry_count(&mut context, &step.name);
                Ok(Next::Enter {
                    flow,
                    state,
                    step: handover_step(format!("{}:handover", step.name), &message),
                    context,
                })
            }
        }
    }

    /// Lookup and structural failures: keep what was already committed and
    /// hand the contact to a human.
    async fn escalate(mut self, err: ParleyError) -> Vec<OutputAction> {
        let engine = self.engine;
        tracing::error!(contact = %self.contact.id, flow = ?self.flow, error = %err, "Escalating to a human");
        match self.hand_over(&err.to_string()).await {
            Ok(()) => self.output,
            Err(handover_err) => engine.fail(&self.contact.id, handover_err).await,
        }
    }

    async fn hand_over(&mut self, reason: &str) -> Result<()> {
        let engine = self.engine;
        let step = handover_step("escalation", &engine.config.exhausted_message);
        let out = engine
            .executor
            .execute(&step, &mut self.contact, Context::new(), false)
            .await?;
        engine.services.store.clear_state(&self.contact.id).await?;
        engine.events.emit(EngineEvent::HumanHandover {
            contact: self.contact.id.clone(),
            flow: self.flow.clone().unwrap_or_default(),
            reason: reason.to_string(),
        });
        self.push(out.actions);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
