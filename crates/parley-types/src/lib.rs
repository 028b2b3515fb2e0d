//! Shared types, errors, context, events and actions for the Parley flow engine.
//!
//! This crate provides the foundational types used across the other Parley crates:
//! - `ParleyError`: unified error taxonomy
//! - `Context`: per-contact key-value scratch space carried across steps
//! - `InboundEvent`: an event delivered to the engine (external or synthetic)
//! - `OutputAction` / `OutboundMessage`: what a processing cycle produces
//! - `Contact` / `ContactFlowState`: the records the engine reads and persists

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Unified error type for all Parley subsystems.
#[derive(Debug, thiserror::Error)]
pub enum ParleyError {
    // === Definition / configuration errors ===
    #[error("Invalid configuration on step '{step}': {message}")]
    Configuration { step: String, message: String },

    #[error("Flow definition invalid: {0}")]
    DefinitionInvalid(String),

    // === Runtime errors ===
    #[error("Reply for '{variable}' rejected: {reason}")]
    ReplyRejected { variable: String, reason: String },

    #[error("{kind} '{name}' not found")]
    Lookup { kind: String, name: String },

    #[error("Step '{step}' in flow '{flow}' has no matching transition")]
    Structural { flow: String, step: String },

    #[error("State for contact '{contact}' was modified concurrently")]
    Conflict { contact: String },

    #[error("Flow '{flow}' exceeded {limit} steps in a single cycle")]
    IterationBudgetExceeded { flow: String, limit: usize },

    // === Collaborator errors ===
    #[error("State store error: {0}")]
    Store(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Template error: {0}")]
    Template(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl ParleyError {
    /// Shorthand for a [`ParleyError::Lookup`].
    pub fn lookup(kind: impl Into<String>, name: impl Into<String>) -> Self {
        ParleyError::Lookup {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Returns `true` if another writer committed first. The losing cycle is
    /// dropped without touching the state.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ParleyError::Conflict { .. })
    }

    /// Returns `true` if the failure breaks the flow in a way a human operator
    /// should pick up (missing flow/step/entity, authoring dead end, runaway loop).
    pub fn escalates_to_human(&self) -> bool {
        matches!(
            self,
            ParleyError::Lookup { .. }
                | ParleyError::Structural { .. }
                | ParleyError::IterationBudgetExceeded { .. }
        )
    }
}

/// A convenience alias for `Result<T, ParleyError>`.
pub type Result<T> = std::result::Result<T, ParleyError>;

// ---------------------------------------------------------------------------
// JSON helpers shared by the engine
// ---------------------------------------------------------------------------

/// Walk a dotted path (`a.b.0.c`) through nested maps and lists.
///
/// Numeric segments index into arrays. Returns `None` for any missing hop.
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Insert `value` at a dotted path, creating intermediate maps as needed.
/// Non-map intermediates are replaced.
pub fn insert_path(root: &mut Map<String, Value>, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut current = root;
    for segment in parents {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(map) = entry else {
            return;
        };
        current = map;
    }
    current.insert(last.to_string(), value);
}

/// String form used for comparisons: strings unquoted, `null` empty,
/// everything else in its JSON rendering.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Context: per-contact key-value scratch space
// ---------------------------------------------------------------------------

/// Key-value store carried across the steps of one flow instance.
///
/// A `Context` belongs to exactly one `ContactFlowState` and is only mutated
/// by the cycle that holds the contact's lock, so it is plain owned data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context {
    values: Map<String, Value>,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(values: Map<String, Value>) -> Self {
        Self { values }
    }

    /// Insert or overwrite a top-level key.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Insert at a dotted path, creating nested maps.
    pub fn set_path(&mut self, path: &str, value: Value) {
        insert_path(&mut self.values, path, value);
    }

    /// Read a top-level value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Read a value by dotted path. Top-level keys containing dots win over
    /// nested traversal.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        if let Some(v) = self.values.get(path) {
            return Some(v);
        }
        let (head, rest) = path.split_once('.')?;
        lookup_path(self.values.get(head)?, rest)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    /// The context as a JSON object (for template scopes).
    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<Map<String, Value>> for Context {
    fn from(values: Map<String, Value>) -> Self {
        Self::from_map(values)
    }
}

// ---------------------------------------------------------------------------
// InboundEvent: what drives a processing cycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Text,
    Interactive,
    Image,
    Location,
    Form,
    /// Synthetic marker produced by the loop controller, never by a contact.
    Internal,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Text => "text",
            EventKind::Interactive => "interactive",
            EventKind::Image => "image",
            EventKind::Location => "location",
            EventKind::Form => "form",
            EventKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRef {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Provider message id, used to drop duplicate deliveries.
    #[serde(default)]
    pub id: Option<String>,
    pub kind: EventKind,
    #[serde(default)]
    pub text: Option<String>,
    /// Identifier of the chosen interactive option (button / list row).
    #[serde(default)]
    pub reply_id: Option<String>,
    #[serde(default)]
    pub media: Option<MediaRef>,
    #[serde(default)]
    pub location: Option<GeoPoint>,
    #[serde(default)]
    pub form: Option<Value>,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    fn bare(kind: EventKind) -> Self {
        Self {
            id: None,
            kind,
            text: None,
            reply_id: None,
            media: None,
            location: None,
            form: None,
            received_at: Utc::now(),
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self {
            text: Some(body.into()),
            ..Self::bare(EventKind::Text)
        }
    }

    /// An interactive reply: `reply_id` is the option identifier, `title` the
    /// visible text the contact tapped.
    pub fn reply(reply_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            reply_id: Some(reply_id.into()),
            text: Some(title.into()),
            ..Self::bare(EventKind::Interactive)
        }
    }

    pub fn image(media: MediaRef) -> Self {
        Self {
            media: Some(media),
            ..Self::bare(EventKind::Image)
        }
    }

    pub fn location(latitude: f64, longitude: f64) -> Self {
        Self {
            location: Some(GeoPoint {
                latitude,
                longitude,
            }),
            ..Self::bare(EventKind::Location)
        }
    }

    pub fn form(payload: Value) -> Self {
        Self {
            form: Some(payload),
            ..Self::bare(EventKind::Form)
        }
    }

    /// Synthetic event used to continue the loop after fall-through steps.
    pub fn internal() -> Self {
        Self::bare(EventKind::Internal)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn is_internal(&self) -> bool {
        self.kind == EventKind::Internal
    }

    pub fn text_body(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }
}

// ---------------------------------------------------------------------------
// OutboundMessage / OutputAction: what a cycle produces
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Document,
    Audio,
    Video,
    Interactive,
    Template,
    Structured,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub kind: MessageKind,
    pub payload: Value,
}

impl OutboundMessage {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            payload: serde_json::json!({ "body": body.into() }),
        }
    }

    /// Text body of a text message, if any.
    pub fn body(&self) -> Option<&str> {
        self.payload.get("body").and_then(Value::as_str)
    }

    /// A message with nothing worth sending: an empty text body, a media
    /// message with no link or id, or an empty payload.
    pub fn is_empty(&self) -> bool {
        match self.kind {
            MessageKind::Text => self.body().map_or(true, |b| b.trim().is_empty()),
            MessageKind::Image | MessageKind::Document | MessageKind::Audio | MessageKind::Video => {
                let has = |k: &str| {
                    self.payload
                        .get(k)
                        .and_then(Value::as_str)
                        .is_some_and(|s| !s.trim().is_empty())
                };
                !has("url") && !has("id")
            }
            _ => match &self.payload {
                Value::Null => true,
                Value::Object(map) => map.is_empty(),
                _ => false,
            },
        }
    }
}

/// Actions produced by step execution and consumed by the loop controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OutputAction {
    SendMessage(OutboundMessage),
    /// Remove the contact's flow state; the flow is over.
    ClearState,
    /// Internal control action: leave the current flow and start `flow`.
    SwitchFlow {
        flow: String,
        #[serde(default)]
        initial_context: Map<String, Value>,
    },
}

impl OutputAction {
    pub fn send(message: OutboundMessage) -> Self {
        OutputAction::SendMessage(message)
    }

    pub fn message(&self) -> Option<&OutboundMessage> {
        match self {
            OutputAction::SendMessage(m) => Some(m),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Contact: external entity the engine converses with
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedAccount {
    pub id: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    #[serde(default)]
    pub needs_human_intervention: bool,
    #[serde(default)]
    pub intervention_requested_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub profile: Map<String, Value>,
    #[serde(default)]
    pub linked_account: Option<LinkedAccount>,
}

impl Contact {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            needs_human_intervention: false,
            intervention_requested_at: None,
            attributes: Map::new(),
            profile: Map::new(),
            linked_account: None,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn with_profile(mut self, key: impl Into<String>, value: Value) -> Self {
        self.profile.insert(key.into(), value);
        self
    }

    /// Linked to an active privileged account.
    pub fn is_privileged(&self) -> bool {
        self.linked_account.as_ref().is_some_and(|a| a.active)
    }

    /// Data-only view used by templates and conditions: attributes merged with
    /// the built-in fields. Built-ins win over same-named attributes.
    pub fn scope_value(&self) -> Value {
        let mut view = self.attributes.clone();
        view.insert("id".into(), Value::String(self.id.clone()));
        view.insert(
            "needs_human_intervention".into(),
            Value::Bool(self.needs_human_intervention),
        );
        Value::Object(view)
    }
}

// ---------------------------------------------------------------------------
// ContactFlowState: the persisted position of a contact in a flow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactFlowState {
    pub id: Uuid,
    pub contact_id: String,
    pub flow: String,
    pub step: String,
    pub context: Context,
    /// Bumped on every committed write; used for optimistic checks.
    pub version: u64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContactFlowState {
    pub fn new(
        contact_id: impl Into<String>,
        flow: impl Into<String>,
        step: impl Into<String>,
        context: Context,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            contact_id: contact_id.into(),
            flow: flow.into(),
            step: step.into(),
            context,
            version: 0,
            started_at: now,
            updated_at: now,
        }
    }
}
