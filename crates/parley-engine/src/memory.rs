//! In-memory collaborators, used by the CLI and by tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_types::{
    insert_path, value_to_string, Contact, ContactFlowState, Context, OutboundMessage,
    ParleyError, Result,
};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::services::{ContactDirectory, Dispatcher, EntityQuery, EntityStore, Notifier, Services};
use crate::store::{StateStore, TransitionResult};

// ---------------------------------------------------------------------------
// InMemoryStateStore
// ---------------------------------------------------------------------------

/// Keyed by contact id, so a second state for a contact cannot exist.
#[derive(Default)]
pub struct InMemoryStateStore {
    states: RwLock<HashMap<String, ContactFlowState>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.states.read().await.is_empty()
    }
}

fn find_by_id(
    states: &mut HashMap<String, ContactFlowState>,
    state_id: Uuid,
) -> Option<&mut ContactFlowState> {
    states.values_mut().find(|s| s.id == state_id)
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load_state(&self, contact_id: &str) -> Result<Option<ContactFlowState>> {
        Ok(self.states.read().await.get(contact_id).cloned())
    }

    async fn create_state(
        &self,
        contact_id: &str,
        flow: &str,
        step: &str,
        context: Context,
    ) -> Result<ContactFlowState> {
        let mut states = self.states.write().await;
        if states.contains_key(contact_id) {
            return Err(ParleyError::Conflict {
                contact: contact_id.to_string(),
            });
        }
        let state = ContactFlowState::new(contact_id, flow, step, context);
        states.insert(contact_id.to_string(), state.clone());
        Ok(state)
    }

    async fn atomic_transition(
        &self,
        state_id: Uuid,
        expected_version: u64,
        step: &str,
        context: Context,
    ) -> Result<TransitionResult> {
        let mut states = self.states.write().await;
        let Some(state) = find_by_id(&mut states, state_id) else {
            return Ok(TransitionResult::Conflict);
        };
        if state.version != expected_version {
            return Ok(TransitionResult::Conflict);
        }
        state.step = step.to_string();
        state.context = context;
        state.version += 1;
        state.updated_at = Utc::now();
        Ok(TransitionResult::Committed(state.clone()))
    }

    async fn switch_flow(
        &self,
        state_id: Uuid,
        expected_version: u64,
        flow: &str,
        step: &str,
        context: Context,
    ) -> Result<TransitionResult> {
        let mut states = self.states.write().await;
        let Some(state) = find_by_id(&mut states, state_id) else {
            return Ok(TransitionResult::Conflict);
        };
        if state.version != expected_version {
            return Ok(TransitionResult::Conflict);
        }
        let mut replacement = ContactFlowState::new(state.contact_id.clone(), flow, step, context);
        replacement.version = state.version + 1;
        *state = replacement;
        Ok(TransitionResult::Committed(state.clone()))
    }

    async fn clear_state(&self, contact_id: &str) -> Result<bool> {
        Ok(self.states.write().await.remove(contact_id).is_some())
    }

    async fn idle_states(&self, updated_before: DateTime<Utc>) -> Result<Vec<ContactFlowState>> {
        let states = self.states.read().await;
        let mut idle: Vec<_> = states
            .values()
            .filter(|s| s.updated_at < updated_before)
            .cloned()
            .collect();
        idle.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(idle)
    }
}

// ---------------------------------------------------------------------------
// InMemoryContacts
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryContacts {
    contacts: RwLock<HashMap<String, Contact>>,
}

impl InMemoryContacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, contact: Contact) {
        self.contacts.write().await.insert(contact.id.clone(), contact);
    }

    pub async fn get(&self, contact_id: &str) -> Option<Contact> {
        self.contacts.read().await.get(contact_id).cloned()
    }
}

#[async_trait]
impl ContactDirectory for InMemoryContacts {
    async fn load_contact(&self, contact_id: &str) -> Result<Option<Contact>> {
        Ok(self.get(contact_id).await)
    }

    async fn write_attribute(&self, contact_id: &str, path: &str, value: Value) -> Result<()> {
        let mut contacts = self.contacts.write().await;
        let contact = contacts
            .get_mut(contact_id)
            .ok_or_else(|| ParleyError::lookup("contact", contact_id))?;
        match path.strip_prefix("profile.") {
            Some(field) => insert_path(&mut contact.profile, field, value),
            None => insert_path(&mut contact.attributes, path, value),
        }
        Ok(())
    }

    async fn flag_human_intervention(&self, contact_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut contacts = self.contacts.write().await;
        let contact = contacts
            .get_mut(contact_id)
            .ok_or_else(|| ParleyError::lookup("contact", contact_id))?;
        contact.needs_human_intervention = true;
        contact.intervention_requested_at = Some(at);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingDispatcher
// ---------------------------------------------------------------------------

/// Records every queued message in order.
#[derive(Default)]
pub struct RecordingDispatcher {
    sent: Mutex<Vec<(String, OutboundMessage)>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, OutboundMessage)> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn sent_to(&self, recipient: &str) -> Vec<OutboundMessage> {
        self.sent()
            .into_iter()
            .filter(|(r, _)| r == recipient)
            .map(|(_, m)| m)
            .collect()
    }

    /// Text bodies sent to `recipient`, in order.
    pub fn bodies(&self, recipient: &str) -> Vec<String> {
        self.sent_to(recipient)
            .iter()
            .filter_map(|m| m.body().map(String::from))
            .collect()
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn enqueue_outbound(&self, recipient: &str, message: &OutboundMessage) -> Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((recipient.to_string(), message.clone()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingNotifier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub groups: Vec<String>,
    pub template: String,
    pub context: Value,
}

#[derive(Default)]
pub struct RecordingNotifier {
    notifications: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_group(&self, groups: &[String], template: &str, context: &Value) -> Result<()> {
        self.notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Notification {
                groups: groups.to_vec(),
                template: template.to_string(),
                context: context.clone(),
            });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// InMemoryEntities
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryEntities {
    collections: RwLock<HashMap<String, Vec<Map<String, Value>>>>,
}

impl InMemoryEntities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collection, optionally seeded with rows.
    pub async fn add_collection(&self, name: &str, rows: Vec<Map<String, Value>>) {
        self.collections.write().await.insert(name.to_string(), rows);
    }

    pub async fn rows(&self, collection: &str) -> Vec<Map<String, Value>> {
        self.collections
            .read()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }
}

fn compare_field(a: &Map<String, Value>, b: &Map<String, Value>, field: &str) -> std::cmp::Ordering {
    match (a.get(field), b.get(field)) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(std::cmp::Ordering::Equal),
        (x, y) => {
            let x = x.map(value_to_string).unwrap_or_default();
            let y = y.map(value_to_string).unwrap_or_default();
            x.cmp(&y)
        }
    }
}

#[async_trait]
impl EntityStore for InMemoryEntities {
    async fn query(&self, query: &EntityQuery) -> Result<Vec<Map<String, Value>>> {
        let collections = self.collections.read().await;
        let rows = collections
            .get(&query.collection)
            .ok_or_else(|| ParleyError::lookup("collection", &query.collection))?;

        let mut matched: Vec<_> = rows
            .iter()
            .filter(|row| {
                query.filters.iter().all(|(field, expected)| {
                    row.get(field)
                        .is_some_and(|actual| value_to_string(actual) == value_to_string(expected))
                })
            })
            .cloned()
            .collect();

        for key in query.order_by.iter().rev() {
            let (field, descending) = match key.strip_prefix('-') {
                Some(field) => (field, true),
                None => (key.as_str(), false),
            };
            matched.sort_by(|a, b| {
                let ord = compare_field(a, b, field);
                if descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }

        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn create(&self, collection: &str, mut fields: Map<String, Value>) -> Result<String> {
        let mut collections = self.collections.write().await;
        let rows = collections
            .get_mut(collection)
            .ok_or_else(|| ParleyError::lookup("collection", collection))?;
        let id = Uuid::new_v4().to_string();
        fields.insert("id".into(), Value::String(id.clone()));
        rows.push(fields);
        Ok(id)
    }
}

// ---------------------------------------------------------------------------
// InMemoryServices
// ---------------------------------------------------------------------------

/// One in-memory instance of every collaborator, with typed handles kept for
/// inspection.
#[derive(Clone, Default)]
pub struct InMemoryServices {
    pub store: Arc<InMemoryStateStore>,
    pub contacts: Arc<InMemoryContacts>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub notifier: Arc<RecordingNotifier>,
    pub entities: Arc<InMemoryEntities>,
}

impl InMemoryServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn services(&self) -> Services {
        Services {
            store: self.store.clone(),
            contacts: self.contacts.clone(),
            dispatcher: self.dispatcher.clone(),
            notifier: self.notifier.clone(),
            entities: self.entities.clone(),
        }
    }
}
