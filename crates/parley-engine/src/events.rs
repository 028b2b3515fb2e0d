//! Conversation events published by the engine.
//!
//! Each cycle reports triggers, replies, fallbacks and state changes as
//! [`EngineEvent`]s on a broadcast channel. Embedding services and tests
//! listen there instead of scraping logs.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted while processing inbound events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    FlowTriggered {
        contact: String,
        flow: String,
    },
    StepEntered {
        contact: String,
        flow: String,
        step: String,
        kind: String,
    },
    FlowSwitched {
        contact: String,
        from_flow: String,
        to_flow: String,
    },
    ReplyAccepted {
        contact: String,
        step: String,
        variable: String,
    },
    ReplyRejected {
        contact: String,
        step: String,
        reason: String,
    },
    FallbackEngaged {
        contact: String,
        step: String,
        attempt: u32,
    },
    HumanHandover {
        contact: String,
        flow: String,
        reason: String,
    },
    StateCleared {
        contact: String,
        flow: String,
    },
    CycleFailed {
        contact: String,
        error: String,
    },
    StateExpired {
        contact: String,
        flow: String,
    },
}

/// Fan-out point for [`EngineEvent`]s. Cloning shares the channel.
///
/// A listener that falls more than `capacity` events behind sees
/// `RecvError::Lagged` and skips ahead; the engine never waits on listeners.
#[derive(Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to whoever is listening. With nobody subscribed the event is
    /// dropped.
    pub fn emit(&self, event: EngineEvent) {
        if let Err(broadcast::error::SendError(event)) = self.sender.send(event) {
            tracing::trace!(?event, "No event listeners");
        }
    }

    /// Events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn subscribers(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
