//! Persistence contract for contact flow state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_types::{ContactFlowState, Context, Result};
use uuid::Uuid;

/// Outcome of a versioned write.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionResult {
    Committed(ContactFlowState),
    /// Another writer committed first, or the state no longer exists.
    Conflict,
}

impl TransitionResult {
    pub fn committed(self) -> Option<ContactFlowState> {
        match self {
            TransitionResult::Committed(state) => Some(state),
            TransitionResult::Conflict => None,
        }
    }
}

/// Store of at most one [`ContactFlowState`] per contact.
///
/// Writes against an existing state carry the version the caller read; a
/// store must refuse the write with [`TransitionResult::Conflict`] when the
/// stored version differs.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_state(&self, contact_id: &str) -> Result<Option<ContactFlowState>>;

    /// Create the contact's state. Fails with a conflict error when one exists.
    async fn create_state(
        &self,
        contact_id: &str,
        flow: &str,
        step: &str,
        context: Context,
    ) -> Result<ContactFlowState>;

    /// Move to `step` with `context` in one write.
    async fn atomic_transition(
        &self,
        state_id: Uuid,
        expected_version: u64,
        step: &str,
        context: Context,
    ) -> Result<TransitionResult>;

    /// Replace the state with a fresh one in `flow` at `step`. The old state
    /// is never observable alongside the new one.
    async fn switch_flow(
        &self,
        state_id: Uuid,
        expected_version: u64,
        flow: &str,
        step: &str,
        context: Context,
    ) -> Result<TransitionResult>;

    /// Delete the contact's state. Returns whether one existed.
    async fn clear_state(&self, contact_id: &str) -> Result<bool>;

    /// States whose last update is older than `updated_before`.
    async fn idle_states(&self, updated_before: DateTime<Utc>) -> Result<Vec<ContactFlowState>>;
}
