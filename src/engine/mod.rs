//! The inbound event reconciliation engine.
//!
//! One [`Engine`] owns all per-conversation state — echo registry, lock
//! cache, debounce buffers, duplicate ledger — as explicit fields behind
//! its own synchronization, never as module-level globals. Events flow one
//! direction: webhook → classifier → (debounce → turn processor) →
//! outbound send → echo registry update. The tasks driving that flow
//! interleave cooperatively at every await point, so each decision that
//! matters is re-validated after the suspensions that could have let
//! another task for the same conversation run in between.

pub mod backlog;
pub mod classifier;
pub mod debounce;
pub mod directives;
pub mod echo;
pub mod event;
pub mod lock;
pub mod turn;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::channels::{ChannelTransport, LabelClient};
use crate::config::{EngineConfig, HandoverConfig};
use crate::observability::{Observer, ObserverEvent};
use crate::providers::ResponseGenerator;
use crate::store::{
    Author, LockSource, LockStore, MessageStore, SessionStatus, SessionStore, StoredMessage,
};

use backlog::BacklogFilter;
use classifier::EventClassifier;
use debounce::{BufferedMessage, DebounceAggregator};
use echo::EchoRegistry;
use event::{Classification, ConversationKey, EventKind, InboundEvent};
use lock::ConversationLock;
use turn::TurnProcessor;

pub struct Engine {
    cfg: EngineConfig,
    handover: HandoverConfig,
    classifier: EventClassifier,
    echoes: Arc<EchoRegistry>,
    locks: Arc<ConversationLock>,
    debouncer: DebounceAggregator,
    messages: Arc<dyn MessageStore>,
    sessions: Arc<dyn SessionStore>,
    observer: Arc<dyn Observer>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: EngineConfig,
        handover: HandoverConfig,
        messages: Arc<dyn MessageStore>,
        lock_store: Arc<dyn LockStore>,
        sessions: Arc<dyn SessionStore>,
        transport: Arc<dyn ChannelTransport>,
        labels: Arc<dyn LabelClient>,
        generator: Arc<dyn ResponseGenerator>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        let echoes = Arc::new(EchoRegistry::new(&cfg));
        let backlog = Arc::new(BacklogFilter::new(cfg.backlog_tolerance_secs));
        let locks = Arc::new(ConversationLock::new(
            &cfg,
            handover.clone(),
            lock_store,
            messages.clone(),
        ));
        let classifier =
            EventClassifier::new(&cfg, echoes.clone(), backlog, messages.clone());
        let processor = Arc::new(TurnProcessor::new(
            locks.clone(),
            sessions.clone(),
            messages.clone(),
            echoes.clone(),
            transport,
            labels,
            generator,
            observer.clone(),
            handover.clone(),
        ));
        let debouncer = DebounceAggregator::new(processor);

        Self {
            cfg,
            handover,
            classifier,
            echoes,
            locks,
            debouncer,
            messages,
            sessions,
            observer,
        }
    }

    /// Entry point for every normalized webhook event.
    pub async fn handle_event(&self, event: InboundEvent) {
        if !event.has_required_fields() {
            self.observer.record_event(&ObserverEvent::EventDropped {
                channel_id: event.channel_id.clone(),
                reason: "missing required fields".into(),
            });
            return;
        }

        match &event.kind {
            EventKind::StateChange(status) => {
                self.handle_state_change(&event.channel_id, status).await;
                return;
            }
            EventKind::LabelApplied(label) => {
                self.handle_label(&event, label).await;
                return;
            }
            EventKind::Message => {}
        }

        let classification = self.classifier.classify(&event).await;
        self.observer.record_event(&ObserverEvent::EventClassified {
            key: event.conversation_key(),
            message_id: event.message_id.clone(),
            classification,
        });
        self.classifier.note_classified(&event.message_id);

        match classification {
            Classification::UserMessage => self.handle_user_message(&event).await,
            Classification::AdminMessage => self.handle_admin_message(&event).await,
            // An echo of our own send: recognized and discarded, nothing
            // written anywhere.
            Classification::SelfEcho => {
                debug!(message_id = %event.message_id, "discarding self echo");
            }
            Classification::Duplicate | Classification::Backlog | Classification::Ignored => {}
        }
    }

    async fn handle_user_message(&self, event: &InboundEvent) {
        let key = event.conversation_key();
        let record = StoredMessage {
            channel_id: key.channel_id.clone(),
            participant_id: key.participant_id.clone(),
            message_id: Some(event.message_id.clone()),
            author: Author::User,
            body: event.body.clone(),
            normalized_body: event.normalized_body(),
            created_at_ms: event.timestamp_secs * 1000,
        };
        if let Err(e) = self.messages.append(record).await {
            self.observer.record_event(&ObserverEvent::Error {
                component: "store".into(),
                message: e.to_string(),
            });
        }

        // Buffered regardless of lock state: locking suppresses replies,
        // never the user's own words.
        self.debouncer.enqueue(
            key,
            BufferedMessage::from_event(event),
            self.cfg.debounce_wait_for(&event.channel_id),
        );
    }

    /// A human operator's own outbound reply. Persist it, then let its
    /// emoji decide how long the bot stays out of the conversation.
    async fn handle_admin_message(&self, event: &InboundEvent) {
        let key = event.conversation_key();
        let record = StoredMessage {
            channel_id: key.channel_id.clone(),
            participant_id: key.participant_id.clone(),
            message_id: Some(event.message_id.clone()),
            author: Author::Operator,
            body: event.body.clone(),
            normalized_body: event.normalized_body(),
            created_at_ms: event.timestamp_secs * 1000,
        };
        if let Err(e) = self.messages.append(record).await {
            self.observer.record_event(&ObserverEvent::Error {
                component: "store".into(),
                message: e.to_string(),
            });
        }

        let result = if self.handover.contains_unlock_emoji(&event.body) {
            self.lock_changed(&key, false, "operator unlock emoji");
            self.locks.unlock(&key).await
        } else if self.handover.contains_lock_emoji(&event.body) {
            self.lock_changed(&key, true, "operator lock emoji");
            self.locks
                .lock(&key, self.handover.emoji_ttl_secs, LockSource::Emoji)
                .await
        } else {
            // An unexplained human reply: yield briefly so the operator can
            // finish their exchange, without shortening a longer lock.
            self.lock_changed(&key, true, "operator replied");
            self.locks
                .lock_if_extends(&key, self.handover.admin_reply_ttl_secs, LockSource::AdminReply)
                .await
        };
        if let Err(e) = result {
            self.observer.record_event(&ObserverEvent::Error {
                component: "lock".into(),
                message: e.to_string(),
            });
        }
    }

    async fn handle_state_change(&self, channel_id: &str, status: &str) {
        match SessionStatus::from_gateway_state(status) {
            Some(mapped) => {
                info!(channel = %channel_id, status = %status, "session state change");
                if let Err(e) = self.sessions.upsert_status(channel_id, mapped).await {
                    self.observer.record_event(&ObserverEvent::Error {
                        component: "sessions".into(),
                        message: e.to_string(),
                    });
                }
            }
            None => {
                debug!(channel = %channel_id, status = %status, "unmapped state change");
            }
        }
    }

    async fn handle_label(&self, event: &InboundEvent, label: &str) {
        // Label events carry no participant on some gateways; a blocking
        // label without a participant has nothing to lock.
        if !self.handover.is_blocking_label(label) {
            info!(channel = %event.channel_id, label = %label, "non-blocking label observed");
            return;
        }
        if event.from_id.is_empty() {
            info!(channel = %event.channel_id, label = %label, "blocking label without participant");
            return;
        }
        let key = ConversationKey::new(event.channel_id.clone(), event.from_id.clone());
        self.lock_changed(&key, true, "blocking label applied");
        if let Err(e) = self
            .locks
            .lock(&key, self.handover.label_ttl_secs, LockSource::Label)
            .await
        {
            self.observer.record_event(&ObserverEvent::Error {
                component: "lock".into(),
                message: e.to_string(),
            });
        }
    }

    fn lock_changed(&self, key: &ConversationKey, locked: bool, reason: &str) {
        self.observer.record_event(&ObserverEvent::LockChanged {
            key: key.clone(),
            locked,
            reason: reason.to_string(),
        });
    }

    /// Periodic pruning of every in-memory map, independent of any single
    /// conversation's activity. Runs until the token is cancelled.
    pub fn spawn_maintenance(self: &Arc<Self>, cancel: CancellationToken) {
        let engine = Arc::clone(self);
        let interval = std::time::Duration::from_secs(self.cfg.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        engine.echoes.sweep();
                        engine.classifier.sweep();
                        engine.locks.sweep();
                        engine.observer.record_event(&ObserverEvent::SweepTick);
                    }
                    () = cancel.cancelled() => break,
                }
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn open_buffers(&self) -> usize {
        self.debouncer.open_buffers()
    }
}
