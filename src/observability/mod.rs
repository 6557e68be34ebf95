//! Audit events the engine records about its own decisions.
//!
//! Every dropped event, policy rejection, silent turn, and caught error goes
//! through an [`Observer`] so operators can reconstruct why a conversation
//! did or did not get a reply. The default observer writes structured
//! tracing lines; deployments can plug in their own sink.

use tracing::{info, warn};

use crate::engine::event::{Classification, ConversationKey};

/// Something the engine wants on the audit trail.
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    /// An inbound event was classified.
    EventClassified {
        key: ConversationKey,
        message_id: String,
        classification: Classification,
    },
    /// An event was dropped before classification (malformed payload).
    EventDropped { channel_id: String, reason: String },
    /// A debounced batch was handed to the turn processor.
    TurnStarted { key: ConversationKey, batch_len: usize },
    /// A reply went out.
    ReplySent { key: ConversationKey, chars: usize },
    /// The generator chose to stay silent. Not an error.
    SilentTurn { key: ConversationKey },
    /// A turn ended early on a policy gate (lock, authorization, quota).
    PolicyRejection { key: ConversationKey, reason: String },
    /// Handover state changed.
    LockChanged {
        key: ConversationKey,
        locked: bool,
        reason: String,
    },
    /// The periodic maintenance sweep ran.
    SweepTick,
    /// A component failed; the failure was contained.
    Error { component: String, message: String },
}

pub trait Observer: Send + Sync {
    fn record_event(&self, event: &ObserverEvent);
}

/// Default observer: structured tracing output, one line per event.
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn record_event(&self, event: &ObserverEvent) {
        match event {
            ObserverEvent::EventClassified {
                key,
                message_id,
                classification,
            } => {
                info!(conversation = %key, message_id = %message_id, verdict = classification.as_str(), "event classified");
            }
            ObserverEvent::EventDropped { channel_id, reason } => {
                warn!(channel = %channel_id, reason = %reason, "event dropped");
            }
            ObserverEvent::TurnStarted { key, batch_len } => {
                info!(conversation = %key, batch_len, "turn started");
            }
            ObserverEvent::ReplySent { key, chars } => {
                info!(conversation = %key, chars, "reply sent");
            }
            ObserverEvent::SilentTurn { key } => {
                info!(conversation = %key, "generator stayed silent");
            }
            ObserverEvent::PolicyRejection { key, reason } => {
                info!(conversation = %key, reason = %reason, "turn rejected by policy");
            }
            ObserverEvent::LockChanged { key, locked, reason } => {
                info!(conversation = %key, locked, reason = %reason, "handover state changed");
            }
            ObserverEvent::SweepTick => {
                info!("maintenance sweep");
            }
            ObserverEvent::Error { component, message } => {
                warn!(component = %component, error = %message, "contained failure");
            }
        }
    }
}

/// Observer that drops everything. Used by tests that assert on behavior,
/// not on the audit trail.
pub struct NullObserver;

impl Observer for NullObserver {
    fn record_event(&self, _event: &ObserverEvent) {}
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Records every event for later assertions.
    #[derive(Default)]
    pub struct RecordingObserver {
        pub events: Mutex<Vec<ObserverEvent>>,
    }

    impl Observer for RecordingObserver {
        fn record_event(&self, event: &ObserverEvent) {
            self.events.lock().push(event.clone());
        }
    }

    impl RecordingObserver {
        pub fn count_errors(&self) -> usize {
            self.events
                .lock()
                .iter()
                .filter(|e| matches!(e, ObserverEvent::Error { .. }))
                .count()
        }
    }
}
