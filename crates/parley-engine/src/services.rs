//! Collaborators the engine calls out to: outbound dispatch, group
//! notifications, the entity store and the contact directory.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_types::{Contact, OutboundMessage, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::store::StateStore;

#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Queue a message for delivery. Delivery itself is not awaited.
    async fn enqueue_outbound(&self, recipient: &str, message: &OutboundMessage) -> Result<()>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_group(&self, groups: &[String], template: &str, context: &Value) -> Result<()>;
}

/// A flat query against an entity collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityQuery {
    pub collection: String,
    /// Field equality filters, compared by string form.
    #[serde(default)]
    pub filters: Map<String, Value>,
    /// Field names; a leading `-` sorts descending.
    #[serde(default)]
    pub order_by: Vec<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Matching rows as flat field maps.
    async fn query(&self, query: &EntityQuery) -> Result<Vec<Map<String, Value>>>;

    /// Create a row and return its id.
    async fn create(&self, collection: &str, fields: Map<String, Value>) -> Result<String>;
}

#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn load_contact(&self, contact_id: &str) -> Result<Option<Contact>>;

    /// Write one field. `path` is a dotted attribute path, or `profile.<path>`
    /// for profile fields.
    async fn write_attribute(&self, contact_id: &str, path: &str, value: Value) -> Result<()>;

    async fn flag_human_intervention(&self, contact_id: &str, at: DateTime<Utc>) -> Result<()>;
}

/// Every collaborator the engine needs, shared behind `Arc`.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn StateStore>,
    pub contacts: Arc<dyn ContactDirectory>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub notifier: Arc<dyn Notifier>,
    pub entities: Arc<dyn EntityStore>,
}
