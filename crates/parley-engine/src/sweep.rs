//! Inactivity sweep: closes conversations nobody touched within the
//! configured timeout.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parley_types::{OutboundMessage, OutputAction, Result};
use tokio::task::JoinHandle;

use crate::engine::FlowEngine;
use crate::events::EngineEvent;

impl FlowEngine {
    /// Clear every state idle since before `now - inactivity_timeout` and send
    /// the timeout notice. Each contact is re-checked under its lock, so a
    /// conversation that moved in the meantime is left alone. Returns how many
    /// states were closed.
    pub async fn sweep_inactive(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - self.config.inactivity_timeout();
        let candidates = self.services.store.idle_states(cutoff).await?;
        let mut closed = 0;

        for candidate in candidates {
            let contact_id = candidate.contact_id.as_str();
            let _guard = self.locks.acquire(contact_id).await;

            let current = self.services.store.load_state(contact_id).await?;
            let still_idle = current
                .as_ref()
                .is_some_and(|s| s.id == candidate.id && s.updated_at < cutoff);
            if !still_idle {
                tracing::debug!(contact = %contact_id, "State changed since listing, not expired");
                continue;
            }

            if !self.services.store.clear_state(contact_id).await? {
                continue;
            }
            closed += 1;
            tracing::info!(contact = %contact_id, flow = %candidate.flow, idle_since = %candidate.updated_at, "Conversation expired");
            self.events.emit(EngineEvent::StateExpired {
                contact: contact_id.to_string(),
                flow: candidate.flow.clone(),
            });
            let notice = [OutputAction::send(OutboundMessage::text(
                self.config.timeout_message.clone(),
            ))];
            self.dispatch(contact_id, &notice).await;
        }

        self.locks.prune();
        Ok(closed)
    }
}

/// Run [`FlowEngine::sweep_inactive`] every `every` until the task is aborted.
pub fn spawn_sweeper(engine: Arc<FlowEngine>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match engine.sweep_inactive(Utc::now()).await {
                Ok(0) => {}
                Ok(closed) => tracing::info!(closed, "Inactivity sweep finished"),
                Err(err) => tracing::error!(error = %err, "Inactivity sweep failed"),
            }
        }
    })
}
