//! Conversational flow engine: flow definitions, templates, conditions, step
//! execution, fallback policy and the per-contact loop controller.
//!
//! A [`FlowEngine`] owns a validated [`FlowCatalog`], the [`ActionRegistry`]
//! and the collaborator [`Services`]; feed it inbound events with
//! [`FlowEngine::process_event`].

pub mod actions;
pub mod catalog;
pub mod condition;
pub mod config;
pub mod definition;
pub mod engine;
pub mod events;
pub mod executor;
pub mod fallback;
pub mod locks;
pub mod memory;
pub mod reply;
pub mod services;
pub mod step_config;
pub mod store;
pub mod sweep;
pub mod template;
pub mod transition;
pub mod validation;

pub use actions::{builtin_registry, ActionHandler, ActionRegistry, DynAction};
pub use catalog::{FlowCatalog, TriggerMatch};
pub use condition::{parse_condition, Condition, ConditionEvaluator};
pub use config::EngineConfig;
pub use definition::{Flow, FlowDefinition, FlowStep, FlowTransition, Patterns, StepKind};
pub use engine::FlowEngine;
pub use events::{EngineEvent, EventEmitter};
pub use executor::{StepExecutor, StepOutput};
pub use fallback::{FallbackDecision, FallbackPolicy, RetryState};
pub use memory::{
    InMemoryContacts, InMemoryEntities, InMemoryServices, InMemoryStateStore, Notification,
    RecordingDispatcher, RecordingNotifier,
};
pub use reply::{validate_reply, ExpectedReply, PendingReply};
pub use services::{ContactDirectory, Dispatcher, EntityQuery, EntityStore, Notifier, Services};
pub use step_config::{MessageSpec, StepConfig};
pub use store::{StateStore, TransitionResult};
pub use sweep::spawn_sweeper;
pub use template::{render, resolve_value, Scope, Template};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
