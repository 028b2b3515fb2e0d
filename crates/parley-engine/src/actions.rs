//! Action handler trait, dynamic dispatch wrapper, action registry and the
//! built-in actions available to `action_list` steps.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parley_types::{insert_path, Contact, Context, OutputAction, ParleyError, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::services::{ContactDirectory, EntityQuery, EntityStore, Notifier, Services};

/// Contact fields no flow may overwrite.
pub const PROTECTED_CONTACT_FIELDS: &[&str] = &[
    "id",
    "phone",
    "needs_human_intervention",
    "intervention_requested_at",
    "created_at",
];

// ---------------------------------------------------------------------------
// ActionHandler trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// The name flows use to invoke this action.
    fn name(&self) -> &str;

    /// Run the action. `params` have already been template-resolved.
    async fn execute(
        &self,
        contact: &mut Contact,
        context: &mut Context,
        params: &Value,
    ) -> Result<Vec<OutputAction>>;
}

// ---------------------------------------------------------------------------
// DynAction: object-safe wrapper
// ---------------------------------------------------------------------------

pub struct DynAction(Box<dyn ActionHandler>);

impl DynAction {
    pub fn new(handler: impl ActionHandler + 'static) -> Self {
        Self(Box::new(handler))
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub async fn execute(
        &self,
        contact: &mut Contact,
        context: &mut Context,
        params: &Value,
    ) -> Result<Vec<OutputAction>> {
        self.0.execute(contact, context, params).await
    }
}

// ---------------------------------------------------------------------------
// ActionRegistry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, DynAction>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own name, replacing any previous one.
    pub fn register(&mut self, handler: impl ActionHandler + 'static) {
        let name = handler.name().to_string();
        self.handlers.insert(name, DynAction::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<&DynAction> {
        self.handlers.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

fn params<T: DeserializeOwned>(action: &str, raw: &Value) -> Result<T> {
    let raw = match raw {
        Value::Null => Value::Object(Map::new()),
        other => other.clone(),
    };
    serde_json::from_value(raw).map_err(|e| ParleyError::Configuration {
        step: action.to_string(),
        message: format!("invalid params for {action}: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Built-in actions
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SetVariableParams {
    name: String,
    #[serde(default)]
    value: Value,
}

/// `set_variable {name, value}`; dotted names create nested maps.
pub struct SetVariable;

#[async_trait]
impl ActionHandler for SetVariable {
    fn name(&self) -> &str {
        "set_variable"
    }

    async fn execute(
        &self,
        _contact: &mut Contact,
        context: &mut Context,
        raw: &Value,
    ) -> Result<Vec<OutputAction>> {
        let p: SetVariableParams = params(self.name(), raw)?;
        if p.name.trim().is_empty() {
            return Err(ParleyError::Configuration {
                step: self.name().into(),
                message: "variable name must not be empty".into(),
            });
        }
        context.set_path(p.name.trim(), p.value);
        Ok(Vec::new())
    }
}

#[derive(Deserialize)]
struct UpdateContactFieldParams {
    path: String,
    #[serde(default)]
    value: Value,
}

/// `update_contact_field {path, value}` where path is `contact.<attr path>`
/// or `profile.<path>`.
pub struct UpdateContactField {
    contacts: Arc<dyn ContactDirectory>,
}

impl UpdateContactField {
    pub fn new(contacts: Arc<dyn ContactDirectory>) -> Self {
        Self { contacts }
    }
}

#[async_trait]
impl ActionHandler for UpdateContactField {
    fn name(&self) -> &str {
        "update_contact_field"
    }

    async fn execute(
        &self,
        contact: &mut Contact,
        _context: &mut Context,
        raw: &Value,
    ) -> Result<Vec<OutputAction>> {
        let p: UpdateContactFieldParams = params(self.name(), raw)?;
        let path = p.path.trim();

        if let Some(field) = path.strip_prefix("profile.") {
            self.contacts.write_attribute(&contact.id, path, p.value.clone()).await?;
            insert_path(&mut contact.profile, field, p.value);
            return Ok(Vec::new());
        }

        let field = path.strip_prefix("contact.").unwrap_or(path);
        let head = field.split('.').next().unwrap_or_default();
        if field.is_empty() || PROTECTED_CONTACT_FIELDS.iter().any(|f| *f == head) {
            tracing::warn!(contact = %contact.id, field = %field, "Refusing to update protected contact field");
            return Ok(Vec::new());
        }
        self.contacts.write_attribute(&contact.id, field, p.value.clone()).await?;
        insert_path(&mut contact.attributes, field, p.value);
        Ok(Vec::new())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Groups {
    One(String),
    Many(Vec<String>),
}

impl Groups {
    fn into_vec(self) -> Vec<String> {
        match self {
            Groups::One(g) => vec![g],
            Groups::Many(gs) => gs,
        }
    }
}

#[derive(Deserialize)]
struct NotifyGroupParams {
    groups: Groups,
    template: String,
    #[serde(default)]
    context: Option<Value>,
}

/// `notify_group {groups, template, context}`.
pub struct NotifyGroup {
    notifier: Arc<dyn Notifier>,
}

impl NotifyGroup {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl ActionHandler for NotifyGroup {
    fn name(&self) -> &str {
        "notify_group"
    }

    async fn execute(
        &self,
        contact: &mut Contact,
        context: &mut Context,
        raw: &Value,
    ) -> Result<Vec<OutputAction>> {
        let p: NotifyGroupParams = params(self.name(), raw)?;
        let groups = p.groups.into_vec();
        let payload = p.context.unwrap_or_else(|| context.to_value());
        tracing::debug!(contact = %contact.id, groups = ?groups, "Notifying groups");
        self.notifier.notify_group(&groups, &p.template, &payload).await?;
        Ok(Vec::new())
    }
}

#[derive(Deserialize)]
struct QueryEntitiesParams {
    #[serde(flatten)]
    query: EntityQuery,
    #[serde(default)]
    store_as: Option<String>,
}

/// `query_entities {collection, filters, order_by, limit, store_as}`; rows
/// land in the context under `store_as` (default: the collection name).
pub struct QueryEntities {
    entities: Arc<dyn EntityStore>,
}

impl QueryEntities {
    pub fn new(entities: Arc<dyn EntityStore>) -> Self {
        Self { entities }
    }
}

#[async_trait]
impl ActionHandler for QueryEntities {
    fn name(&self) -> &str {
        "query_entities"
    }

    async fn execute(
        &self,
        _contact: &mut Contact,
        context: &mut Context,
        raw: &Value,
    ) -> Result<Vec<OutputAction>> {
        let p: QueryEntitiesParams = params(self.name(), raw)?;
        let rows = self.entities.query(&p.query).await?;
        let key = p.store_as.unwrap_or_else(|| p.query.collection.clone());
        tracing::debug!(collection = %p.query.collection, rows = rows.len(), store_as = %key, "Entities queried");
        context.set_path(&key, Value::Array(rows.into_iter().map(Value::Object).collect()));
        Ok(Vec::new())
    }
}

#[derive(Deserialize)]
struct CreateEntityParams {
    collection: String,
    #[serde(default)]
    fields: Map<String, Value>,
    #[serde(default)]
    store_as: Option<String>,
}

/// `create_entity {collection, fields, store_as}`; stores the fields plus `id`
/// under `store_as` and the id under `<store_as>_id`.
pub struct CreateEntity {
    entities: Arc<dyn EntityStore>,
}

impl CreateEntity {
    pub fn new(entities: Arc<dyn EntityStore>) -> Self {
        Self { entities }
    }
}

#[async_trait]
impl ActionHandler for CreateEntity {
    fn name(&self) -> &str {
        "create_entity"
    }

    async fn execute(
        &self,
        _contact: &mut Contact,
        context: &mut Context,
        raw: &Value,
    ) -> Result<Vec<OutputAction>> {
        let p: CreateEntityParams = params(self.name(), raw)?;
        let id = self.entities.create(&p.collection, p.fields.clone()).await?;
        tracing::info!(collection = %p.collection, id = %id, "Entity created");
        if let Some(key) = p.store_as {
            let mut stored = p.fields;
            stored.insert("id".into(), Value::String(id.clone()));
            context.set_path(&key, Value::Object(stored));
            context.set_path(&format!("{key}_id"), Value::String(id));
        }
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Built-in registry factory
// ---------------------------------------------------------------------------

/// Registry of the built-in actions, wired to the given collaborators.
pub fn builtin_registry(services: &Services) -> ActionRegistry {
    let mut reg = ActionRegistry::new();
    reg.register(SetVariable);
    reg.register(UpdateContactField::new(services.contacts.clone()));
    reg.register(NotifyGroup::new(services.notifier.clone()));
    reg.register(QueryEntities::new(services.entities.clone()));
    reg.register(CreateEntity::new(services.entities.clone()));
    reg
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
