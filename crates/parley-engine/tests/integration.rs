//! End-to-end tests for the Parley flow engine.
//!
//! Each test drives `FlowEngine::process_event` against in-memory
//! collaborators and checks messages, persisted state and contact flags.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use parley_engine::{
    ActionHandler, ActionRegistry, EngineConfig, EngineEvent, FlowCatalog, FlowDefinition,
    FlowEngine, InMemoryServices, InMemoryStateStore, Services, StateStore, TransitionResult,
};
use parley_types::{
    Contact, ContactFlowState, Context, InboundEvent, OutputAction, ParleyError, Result,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn catalog(flows: Value) -> FlowCatalog {
    let definitions: Vec<FlowDefinition> =
        serde_json::from_value(flows).expect("flow JSON should deserialize");
    FlowCatalog::from_definitions(definitions).expect("flows should validate")
}

async fn memory() -> InMemoryServices {
    let mem = InMemoryServices::new();
    mem.contacts
        .insert(Contact::new("c1").with_profile("first_name", json!("Zoë")))
        .await;
    mem
}

fn engine(flows: Value, mem: &InMemoryServices) -> FlowEngine {
    FlowEngine::with_defaults(catalog(flows), mem.services())
}

fn bodies(actions: &[OutputAction]) -> Vec<String> {
    actions
        .iter()
        .filter_map(|a| a.message().and_then(|m| m.body()).map(String::from))
        .collect()
}

async fn state(mem: &InMemoryServices) -> Option<ContactFlowState> {
    mem.store.load_state("c1").await.expect("load_state")
}

/// Intake flow used by the question scenarios.
fn intake_flows(question_config: Value) -> Value {
    json!([{
        "name": "intake",
        "trigger_keywords": ["menu"],
        "steps": [
            {"name": "ask_age", "kind": "question", "is_entry_point": true,
             "config": question_config,
             "transitions": [{"next_step": "ask_email", "condition": {"kind": "pending_reply_was_valid"}}]},
            {"name": "ask_email", "kind": "question",
             "config": {"message": "And your email?", "variable": "email", "expected_reply": "email"},
             "transitions": [{"next_step": "done", "condition": {"kind": "pending_reply_was_valid"}}]},
            {"name": "done", "kind": "end_flow", "config": {"message": "All set, {{ profile.first_name }}!"}}
        ]
    }])
}

fn age_question(extra: Value) -> Value {
    let mut config = json!({
        "message": "How old are you?",
        "variable": "age",
        "expected_reply": "number",
        "validation_pattern": "^[0-9]{1,2}$",
        "max_retries": 2
    });
    if let (Some(target), Value::Object(more)) = (config.as_object_mut(), extra) {
        target.extend(more);
    }
    config
}

// ---------------------------------------------------------------------------
// Scenario A: trigger starts a flow and stops at the entry question
// ---------------------------------------------------------------------------

#[tokio::test]
async fn trigger_runs_entry_step_and_waits() {
    let mem = memory().await;
    let engine = engine(intake_flows(age_question(json!({}))), &mem);

    let out = engine.process_event("c1", InboundEvent::text("menu")).await;

    assert_eq!(bodies(&out), vec!["How old are you?"]);
    let state = state(&mem).await.expect("state should exist");
    assert_eq!(state.flow, "intake");
    assert_eq!(state.step, "ask_age", "the triggering event must not answer the question");
    assert!(state.context.contains("_pending_reply"));
    assert_eq!(mem.dispatcher.bodies("c1"), vec!["How old are you?"]);
}

// ---------------------------------------------------------------------------
// Scenario B: a valid reply is stored and the flow advances
// ---------------------------------------------------------------------------

#[tokio::test]
async fn valid_number_reply_is_stored_and_advances() {
    let mem = memory().await;
    let engine = engine(intake_flows(age_question(json!({}))), &mem);
    engine.process_event("c1", InboundEvent::text("menu")).await;

    let out = engine.process_event("c1", InboundEvent::text("7")).await;

    assert_eq!(bodies(&out), vec!["And your email?"]);
    let state = state(&mem).await.expect("state should exist");
    assert_eq!(state.step, "ask_email");
    assert_eq!(state.context.get("age"), Some(&json!(7)));
    assert_eq!(
        state.context.get_path("_pending_reply.variable"),
        Some(&json!("email")),
        "marker now belongs to the next question"
    );
    assert!(!state.context.contains("_retry_counts"));

    let out = engine
        .process_event("c1", InboundEvent::text("  Zoe@Example.COM "))
        .await;
    assert_eq!(bodies(&out), vec!["All set, Zoë!"]);
    assert_eq!(out.last(), Some(&OutputAction::ClearState));
    assert!(crate::state(&mem).await.is_none());
}

// ---------------------------------------------------------------------------
// Scenario C: invalid replies re-prompt, then the terminal action runs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invalid_replies_retry_then_hand_over() {
    let mem = memory().await;
    let engine = engine(intake_flows(age_question(json!({}))), &mem);
    let defaults = EngineConfig::default();
    engine.process_event("c1", InboundEvent::text("menu")).await;

    for attempt in 1..=2u64 {
        let out = engine.process_event("c1", InboundEvent::text("abc")).await;
        assert_eq!(
            bodies(&out),
            vec![defaults.default_retry_message.clone(), "How old are you?".to_string()],
            "attempt {attempt} should re-prompt"
        );
        let state = state(&mem).await.expect("state should survive retries");
        assert_eq!(state.step, "ask_age");
        assert_eq!(
            state.context.get_path("_retry_counts.ask_age"),
            Some(&json!(attempt))
        );
        assert!(state.context.contains("_pending_reply"));
    }

    let out = engine.process_event("c1", InboundEvent::text("abc")).await;
    assert_eq!(bodies(&out), vec![defaults.exhausted_message.clone()]);
    assert!(state(&mem).await.is_none());
    let contact = mem.contacts.get("c1").await.unwrap();
    assert!(contact.needs_human_intervention);
    assert!(contact.intervention_requested_at.is_some());
}

#[tokio::test]
async fn configured_terminal_action_runs_when_exhausted() {
    let mem = memory().await;
    let question = age_question(json!({
        "max_retries": 1,
        "retry_message": "Digits only, {{ profile.first_name }}",
        "on_exhausted": {"kind": "end_flow", "config": {"message": "Let's try another time."}}
    }));
    let engine = engine(intake_flows(question), &mem);
    engine.process_event("c1", InboundEvent::text("menu")).await;

    let out = engine.process_event("c1", InboundEvent::text("old")).await;
    assert_eq!(bodies(&out), vec!["Digits only, Zoë", "How old are you?"]);

    let out = engine.process_event("c1", InboundEvent::text("older")).await;
    assert_eq!(bodies(&out), vec!["Let's try another time."]);
    assert_eq!(out.last(), Some(&OutputAction::ClearState));
    assert!(state(&mem).await.is_none());
    assert!(!mem.contacts.get("c1").await.unwrap().needs_human_intervention);
}

#[tokio::test]
async fn exhausted_question_can_switch_flow() {
    let mem = memory().await;
    let question = age_question(json!({
        "max_retries": 1,
        "on_exhausted": {"kind": "switch_flow",
                         "config": {"target_flow": "support", "initial_context": {"reason": "age"}}}
    }));
    let mut flows = intake_flows(question);
    if let Value::Array(list) = &mut flows {
        list.push(json!({
            "name": "support",
            "trigger_keywords": ["support"],
            "steps": [
                {"name": "desk", "kind": "question", "is_entry_point": true,
                 "config": {"message": "Support here about {{ reason }}. What happened?", "variable": "issue"},
                 "transitions": [{"next_step": "bye"}]},
                {"name": "bye", "kind": "end_flow"}
            ]
        }));
    }
    let engine = engine(flows, &mem);
    engine.process_event("c1", InboundEvent::text("menu")).await;
    engine.process_event("c1", InboundEvent::text("x")).await;

    let out = engine.process_event("c1", InboundEvent::text("y")).await;
    assert_eq!(bodies(&out), vec!["Support here about age. What happened?"]);
    let state = state(&mem).await.expect("switched state");
    assert_eq!((state.flow.as_str(), state.step.as_str()), ("support", "desk"));
    assert_eq!(state.context.get("reason"), Some(&json!("age")));
    assert!(!state.context.contains("age"));
    assert!(!mem.contacts.get("c1").await.unwrap().needs_human_intervention);
}

#[tokio::test]
async fn valid_reply_after_retry_resets_counter() {
    let mem = memory().await;
    let engine = engine(intake_flows(age_question(json!({}))), &mem);
    engine.process_event("c1", InboundEvent::text("menu")).await;
    engine.process_event("c1", InboundEvent::text("abc")).await;
    assert_eq!(
        state(&mem).await.unwrap().context.get_path("_retry_counts.ask_age"),
        Some(&json!(1))
    );

    engine.process_event("c1", InboundEvent::text("42")).await;
    let state = state(&mem).await.unwrap();
    assert_eq!(state.step, "ask_email");
    assert!(state.context.get_path("_retry_counts.ask_age").is_none());
}

// ---------------------------------------------------------------------------
// Scenario D: switching flows inside one cycle
// ---------------------------------------------------------------------------

fn switching_flows() -> Value {
    json!([
        {
            "name": "A",
            "trigger_keywords": ["start"],
            "steps": [
                {"name": "prepare", "kind": "action_list", "is_entry_point": true,
                 "config": {"actions": [{"action": "set_variable", "params": {"name": "ticket", "value": "T-9"}}]},
                 "transitions": [{"next_step": "go"}]},
                {"name": "go", "kind": "switch_flow",
                 "config": {"target_flow": "B", "initial_context": {"ticket": "{{ ticket }}", "from": "A"}}}
            ]
        },
        {
            "name": "B",
            "steps": [
                {"name": "confirm", "kind": "question", "is_entry_point": true,
                 "config": {"message": "Confirm ticket {{ ticket }}?", "variable": "ok"},
                 "transitions": [{"next_step": "bye"}]},
                {"name": "bye", "kind": "end_flow"}
            ]
        }
    ])
}

#[tokio::test]
async fn switch_flow_replaces_state_and_runs_target_entry() {
    let mem = memory().await;
    let engine = engine(switching_flows(), &mem);
    let mut events = engine.subscribe();

    let out = engine.process_event("c1", InboundEvent::text("start")).await;

    assert_eq!(bodies(&out), vec!["Confirm ticket T-9?"]);
    assert!(
        out.iter().all(|a| !matches!(a, OutputAction::SwitchFlow { .. })),
        "switch requests are internal"
    );
    assert_eq!(mem.store.len().await, 1, "exactly one state per contact");
    let state = state(&mem).await.unwrap();
    assert_eq!(state.flow, "B");
    assert_eq!(state.step, "confirm");
    assert_eq!(state.context.get("ticket"), Some(&json!("T-9")));
    assert_eq!(state.context.get("from"), Some(&json!("A")));

    let mut switched = false;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::FlowSwitched { from_flow, to_flow, .. } = event {
            assert_eq!((from_flow.as_str(), to_flow.as_str()), ("A", "B"));
            switched = true;
        }
    }
    assert!(switched, "FlowSwitched should be emitted");
}

#[tokio::test]
async fn switch_to_unknown_flow_hands_over() {
    let mem = memory().await;
    let engine = engine(
        json!([{
            "name": "A",
            "trigger_keywords": ["start"],
            "steps": [{"name": "go", "kind": "switch_flow", "is_entry_point": true,
                       "config": {"target_flow": "{{ missing_flow | default:'ghost' }}"}}]
        }]),
        &mem,
    );

    let out = engine.process_event("c1", InboundEvent::text("start")).await;

    assert_eq!(bodies(&out), vec![EngineConfig::default().exhausted_message]);
    assert!(state(&mem).await.is_none());
    assert!(mem.contacts.get("c1").await.unwrap().needs_human_intervention);
}

// ---------------------------------------------------------------------------
// Scenario E: a dead end outside a question escalates once
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unmatched_non_question_step_hands_over_once() {
    let mem = memory().await;
    let engine = engine(
        json!([{
            "name": "status",
            "trigger_keywords": ["status"],
            "steps": [
                {"name": "show", "kind": "send_message", "is_entry_point": true,
                 "config": {"message": "Checking..."},
                 "transitions": [{"next_step": "vip",
                                  "condition": {"kind": "context_variable_equals", "variable": "tier", "value": "gold"}}]},
                {"name": "vip", "kind": "end_flow"}
            ]
        }]),
        &mem,
    );
    let mut events = engine.subscribe();

    let out = engine.process_event("c1", InboundEvent::text("status")).await;

    let exhausted = EngineConfig::default().exhausted_message;
    assert_eq!(bodies(&out), vec!["Checking...".to_string(), exhausted.clone()]);
    assert_eq!(
        mem.dispatcher.bodies("c1").iter().filter(|b| **b == exhausted).count(),
        1
    );
    assert!(state(&mem).await.is_none());
    assert!(mem.contacts.get("c1").await.unwrap().needs_human_intervention);

    let mut handovers = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, EngineEvent::HumanHandover { .. }) {
            handovers += 1;
        }
    }
    assert_eq!(handovers, 1);
}

// ---------------------------------------------------------------------------
// Duplicates, conflicts and failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_event_is_consumed_once() {
    let mem = memory().await;
    let engine = engine(intake_flows(age_question(json!({}))), &mem);
    engine
        .process_event("c1", InboundEvent::text("menu").with_id("wamid.1"))
        .await;
    engine
        .process_event("c1", InboundEvent::text("abc").with_id("wamid.2"))
        .await;
    let before = state(&mem).await.unwrap();

    let out = engine
        .process_event("c1", InboundEvent::text("abc").with_id("wamid.2"))
        .await;

    assert!(out.is_empty());
    let after = state(&mem).await.unwrap();
    assert_eq!(after.version, before.version);
    assert_eq!(
        after.context.get_path("_retry_counts.ask_age"),
        Some(&json!(1)),
        "retry counter must not move on a replay"
    );
}

#[tokio::test]
async fn replay_is_detected_from_state_across_engines() {
    let mem = memory().await;
    let first = engine(intake_flows(age_question(json!({}))), &mem);
    let second = engine(intake_flows(age_question(json!({}))), &mem);
    first
        .process_event("c1", InboundEvent::text("menu").with_id("e1"))
        .await;
    first
        .process_event("c1", InboundEvent::text("30").with_id("e2"))
        .await;
    let before = state(&mem).await.unwrap();
    assert_eq!(before.context.get("_last_event_id"), Some(&json!("e2")));

    let out = second
        .process_event("c1", InboundEvent::text("30").with_id("e2"))
        .await;

    assert!(out.is_empty());
    assert_eq!(state(&mem).await.unwrap().version, before.version);
}

/// Delegates to the in-memory store but refuses versioned writes on demand.
struct ContestedStore {
    inner: InMemoryStateStore,
    contested: AtomicBool,
}

#[async_trait]
impl StateStore for ContestedStore {
    async fn load_state(&self, contact_id: &str) -> Result<Option<ContactFlowState>> {
        self.inner.load_state(contact_id).await
    }

    async fn create_state(
        &self,
        contact_id: &str,
        flow: &str,
        step: &str,
        context: Context,
    ) -> Result<ContactFlowState> {
        self.inner.create_state(contact_id, flow, step, context).await
    }

    async fn atomic_transition(
        &self,
        state_id: Uuid,
        expected_version: u64,
        step: &str,
        context: Context,
    ) -> Result<TransitionResult> {
        if self.contested.load(Ordering::SeqCst) {
            return Ok(TransitionResult::Conflict);
        }
        self.inner
            .atomic_transition(state_id, expected_version, step, context)
            .await
    }

    async fn switch_flow(
        &self,
        state_id: Uuid,
        expected_version: u64,
        flow: &str,
        step: &str,
        context: Context,
    ) -> Result<TransitionResult> {
        self.inner
            .switch_flow(state_id, expected_version, flow, step, context)
            .await
    }

    async fn clear_state(&self, contact_id: &str) -> Result<bool> {
        self.inner.clear_state(contact_id).await
    }

    async fn idle_states(&self, updated_before: DateTime<Utc>) -> Result<Vec<ContactFlowState>> {
        self.inner.idle_states(updated_before).await
    }
}

#[tokio::test]
async fn conflict_on_first_commit_sends_nothing_and_allows_redelivery() {
    let mem = memory().await;
    let store = Arc::new(ContestedStore {
        inner: InMemoryStateStore::new(),
        contested: AtomicBool::new(false),
    });
    let services = Services {
        store: store.clone(),
        ..mem.services()
    };
    let engine = FlowEngine::with_defaults(catalog(intake_flows(age_question(json!({})))), services);
    engine.process_event("c1", InboundEvent::text("menu")).await;
    let before = store.load_state("c1").await.unwrap().unwrap();
    let sent_before = mem.dispatcher.sent().len();

    store.contested.store(true, Ordering::SeqCst);
    let out = engine
        .process_event("c1", InboundEvent::text("25").with_id("wamid.7"))
        .await;

    assert!(out.is_empty(), "nothing was committed, so nothing is sent");
    assert_eq!(mem.dispatcher.sent().len(), sent_before);
    let after = store.load_state("c1").await.unwrap().unwrap();
    assert_eq!(after, before, "state is left untouched");

    // The provider redelivers the same message once the store settles.
    store.contested.store(false, Ordering::SeqCst);
    let out = engine
        .process_event("c1", InboundEvent::text("25").with_id("wamid.7"))
        .await;
    assert_eq!(bodies(&out), vec!["And your email?"]);
    assert_eq!(store.load_state("c1").await.unwrap().unwrap().step, "ask_email");
}

/// Rewrites the contact's state once, as a second writer would.
struct Interloper {
    store: Arc<InMemoryStateStore>,
    armed: AtomicBool,
}

#[async_trait]
impl ActionHandler for Interloper {
    fn name(&self) -> &str {
        "interloper"
    }

    async fn execute(
        &self,
        contact: &mut Contact,
        _context: &mut Context,
        _params: &Value,
    ) -> Result<Vec<OutputAction>> {
        if self.armed.swap(false, Ordering::SeqCst) {
            if let Some(state) = self.store.load_state(&contact.id).await? {
                self.store
                    .atomic_transition(state.id, state.version, &state.step, state.context.clone())
                    .await?;
            }
        }
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn conflict_after_a_commit_keeps_committed_output() {
    let mem = memory().await;
    let mut registry = ActionRegistry::new();
    registry.register(Interloper {
        store: mem.store.clone(),
        armed: AtomicBool::new(true),
    });
    let engine = FlowEngine::new(
        catalog(json!([{
            "name": "relay",
            "trigger_keywords": ["go"],
            "steps": [
                {"name": "hello", "kind": "send_message", "is_entry_point": true,
                 "config": {"message": "Hello"}, "transitions": [{"next_step": "act"}]},
                {"name": "act", "kind": "action_list",
                 "config": {"actions": [{"action": "interloper"}]}, "transitions": [{"next_step": "done"}]},
                {"name": "done", "kind": "end_flow", "config": {"message": "Bye"}}
            ]
        }])),
        mem.services(),
        registry,
        EngineConfig::default(),
    );

    let out = engine
        .process_event("c1", InboundEvent::text("go").with_id("m1"))
        .await;
    assert_eq!(bodies(&out), vec!["Hello"], "the committed step's message is delivered");
    assert_eq!(mem.dispatcher.bodies("c1"), vec!["Hello"]);
    assert_eq!(state(&mem).await.unwrap().step, "hello");

    // A redelivery is recognised from the state stamp and sends nothing twice.
    let out = engine
        .process_event("c1", InboundEvent::text("go").with_id("m1"))
        .await;
    assert!(out.is_empty());
    assert_eq!(mem.dispatcher.bodies("c1"), vec!["Hello"]);

    // The conversation is not stuck: the next message carries on from "hello".
    let out = engine
        .process_event("c1", InboundEvent::text("ok").with_id("m2"))
        .await;
    assert_eq!(bodies(&out), vec!["Bye"]);
    assert!(state(&mem).await.is_none());
}

struct Explode;

#[async_trait]
impl ActionHandler for Explode {
    fn name(&self) -> &str {
        "explode"
    }

    async fn execute(
        &self,
        _contact: &mut Contact,
        _context: &mut Context,
        _params: &Value,
    ) -> Result<Vec<OutputAction>> {
        Err(ParleyError::Store("connection reset".into()))
    }
}

#[tokio::test]
async fn unexpected_failure_clears_state_and_apologises_once() {
    let mem = memory().await;
    let mut registry = ActionRegistry::new();
    registry.register(Explode);
    let engine = FlowEngine::new(
        catalog(json!([{
            "name": "boom",
            "trigger_keywords": ["boom"],
            "steps": [
                {"name": "hello", "kind": "send_message", "is_entry_point": true,
                 "config": {"message": "Working on it"}, "transitions": [{"next_step": "act"}]},
                {"name": "act", "kind": "action_list",
                 "config": {"actions": [{"action": "explode"}]}, "transitions": [{"next_step": "end"}]},
                {"name": "end", "kind": "end_flow"}
            ]
        }])),
        mem.services(),
        registry,
        EngineConfig::default(),
    );

    let out = engine.process_event("c1", InboundEvent::text("boom")).await;

    let apology = EngineConfig::default().apology_message;
    assert_eq!(bodies(&out), vec![apology.clone()]);
    assert_eq!(mem.dispatcher.bodies("c1"), vec![apology]);
    assert!(mem.store.is_empty().await, "no state survives a failed cycle");
}

// ---------------------------------------------------------------------------
// Loop budget, templates, conditions, actions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn runaway_loop_is_stopped_by_step_budget() {
    let mem = memory().await;
    let config = EngineConfig {
        max_steps_per_cycle: 5,
        ..EngineConfig::default()
    };
    let engine = FlowEngine::new(
        catalog(json!([{
            "name": "spin",
            "trigger_keywords": ["spin"],
            "steps": [
                {"name": "a", "kind": "send_message", "is_entry_point": true,
                 "config": {"message": "a"}, "transitions": [{"next_step": "b"}]},
                {"name": "b", "kind": "send_message",
                 "config": {"message": "b"}, "transitions": [{"next_step": "a"}]}
            ]
        }])),
        mem.services(),
        ActionRegistry::new(),
        config,
    );

    let out = engine.process_event("c1", InboundEvent::text("spin")).await;

    let messages = bodies(&out);
    assert_eq!(messages.len(), 6, "five steps then the handover: {messages:?}");
    assert_eq!(messages.last(), Some(&EngineConfig::default().exhausted_message));
    assert!(state(&mem).await.is_none());
    assert!(mem.contacts.get("c1").await.unwrap().needs_human_intervention);
}

#[tokio::test]
async fn variables_round_trip_through_templates() {
    let mem = memory().await;
    let engine = engine(
        json!([{
            "name": "greet",
            "trigger_keywords": ["hello"],
            "steps": [
                {"name": "remember", "kind": "action_list", "is_entry_point": true,
                 "config": {"actions": [
                     {"action": "set_variable", "params": {"name": "guest.name", "value": "{{ profile.first_name }}"}},
                     {"action": "set_variable", "params": {"name": "code", "value": "A&B <1>"}}
                 ]},
                 "transitions": [{"next_step": "say"}]},
                {"name": "say", "kind": "end_flow",
                 "config": {"message": "Hello {{ guest.name }}, your code is {{ code }}{% if vip %} (VIP){% endif %}."}}
            ]
        }]),
        &mem,
    );

    let out = engine.process_event("c1", InboundEvent::text("Hello")).await;

    assert_eq!(bodies(&out), vec!["Hello Zoë, your code is A&B <1>."]);
}

#[tokio::test]
async fn human_request_and_form_conditions_route() {
    let mem = memory().await;
    let engine = engine(
        json!([{
            "name": "support",
            "trigger_keywords": ["help"],
            "steps": [
                {"name": "how", "kind": "question", "is_entry_point": true,
                 "config": {"message": "Fill the form or ask for an agent", "variable": "answer", "expected_reply": "form"},
                 "transitions": [
                    {"next_step": "agent", "priority": 0, "condition": {"kind": "user_requested_human"}},
                    {"next_step": "urgent", "priority": 1,
                     "condition": {"kind": "structured_form_field_equals", "path": "priority", "value": "high"}},
                    {"next_step": "normal", "priority": 2, "condition": {"kind": "pending_reply_was_valid"}}
                 ]},
                {"name": "agent", "kind": "human_handover",
                 "config": {"message": "Connecting you to an agent"}},
                {"name": "urgent", "kind": "end_flow", "config": {"message": "Escalated: {{ answer.topic }}"}},
                {"name": "normal", "kind": "end_flow", "config": {"message": "Queued"}}
            ]
        }]),
        &mem,
    );

    engine.process_event("c1", InboundEvent::text("help")).await;
    let out = engine
        .process_event("c1", InboundEvent::form(json!({"priority": "high", "topic": "billing"})))
        .await;
    assert_eq!(bodies(&out), vec!["Escalated: billing"]);

    engine.process_event("c1", InboundEvent::text("help")).await;
    let out = engine
        .process_event("c1", InboundEvent::text("can I talk to a human please"))
        .await;
    assert_eq!(bodies(&out), vec!["Connecting you to an agent"]);
    assert!(mem.contacts.get("c1").await.unwrap().needs_human_intervention);
    assert!(state(&mem).await.is_none());
}

#[tokio::test]
async fn builtin_actions_reach_collaborators() {
    let mem = memory().await;
    let mut row = Map::new();
    row.insert("name".into(), json!("Lisbon"));
    row.insert("open".into(), json!(true));
    mem.entities.add_collection("branches", vec![row]).await;

    let engine = engine(
        json!([{
            "name": "book",
            "trigger_keywords": ["book"],
            "steps": [
                {"name": "work", "kind": "action_list", "is_entry_point": true,
                 "config": {"actions": [
                     {"action": "query_entities", "params": {"collection": "branches", "filters": {"open": true}}},
                     {"action": "create_entity", "params": {"collection": "bookings",
                                                             "fields": {"branch": "{{ branches.0.name }}"},
                                                             "store_as": "booking"}},
                     {"action": "update_contact_field", "params": {"path": "profile.city", "value": "{{ booking.branch }}"}},
                     {"action": "notify_group", "params": {"groups": "staff", "template": "new booking {{ booking_id }}"}}
                 ]},
                 "transitions": [{"next_step": "done"}]},
                {"name": "done", "kind": "end_flow", "config": {"message": "Booked at {{ booking.branch }}"}}
            ]
        }]),
        &mem,
    );

    let out = engine.process_event("c1", InboundEvent::text("book")).await;

    assert_eq!(bodies(&out), vec!["Booked at Lisbon"]);
    assert_eq!(mem.entities.rows("bookings").await.len(), 1);
    assert_eq!(
        mem.contacts.get("c1").await.unwrap().profile["city"],
        json!("Lisbon")
    );
    let notifications = mem.notifier.notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].groups, vec!["staff"]);
}

// ---------------------------------------------------------------------------
// Concurrency and loading
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_events_for_one_contact_are_serialised() {
    let mem = memory().await;
    let engine = Arc::new(engine(intake_flows(age_question(json!({}))), &mem));
    engine.process_event("c1", InboundEvent::text("menu")).await;

    let mut handles = Vec::new();
    for i in 0..5 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .process_event("c1", InboundEvent::text("nope").with_id(format!("e{i}")))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // Two retries, then the handover cleared the state; the rest retriggered nothing.
    assert!(state(&mem).await.is_none());
    assert!(mem.store.is_empty().await);
    let exhausted = EngineConfig::default().exhausted_message;
    assert_eq!(
        mem.dispatcher.bodies("c1").iter().filter(|b| **b == exhausted).count(),
        1
    );
}

#[tokio::test]
async fn engine_runs_flows_loaded_from_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("intake.json"),
        serde_json::to_string(&intake_flows(age_question(json!({})))).unwrap(),
    )
    .unwrap();

    let mut catalog = FlowCatalog::new();
    assert_eq!(catalog.load_dir(dir.path()).unwrap(), 1);

    let mem = memory().await;
    let engine = FlowEngine::with_defaults(catalog, mem.services());
    let out = engine.process_event("c1", InboundEvent::text("MENU")).await;
    assert_eq!(bodies(&out), vec!["How old are you?"]);
}
