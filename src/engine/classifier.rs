//! Sorts every inbound webhook event into exactly one category.
//!
//! The decision logic is a priority-ordered guard list; the first guard
//! that matches wins and the rest are never consulted. Keeping the guards
//! as named methods, called in one visible sequence, keeps the precedence
//! auditable and lets each guard be tested in isolation.
//!
//! `classify` is a pure read of the event plus the registry state at call
//! time: it never mutates the duplicate ledger. The engine marks ids as
//! classified separately (see [`EventClassifier::note_classified`]) once it
//! has acted on the verdict, so re-running `classify` on the same event is
//! idempotent.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::EngineConfig;
use crate::engine::backlog::BacklogFilter;
use crate::engine::echo::EchoRegistry;
use crate::engine::event::{Classification, EventKind, InboundEvent};
use crate::store::MessageStore;
use crate::util::now_ms;

pub struct EventClassifier {
    echoes: Arc<EchoRegistry>,
    backlog: Arc<BacklogFilter>,
    messages: Arc<dyn MessageStore>,
    seen: Mutex<HashMap<String, i64>>,
    duplicate_window_ms: i64,
    echo_id_window_ms: i64,
    log_probe_delay: std::time::Duration,
}

impl EventClassifier {
    pub fn new(
        cfg: &EngineConfig,
        echoes: Arc<EchoRegistry>,
        backlog: Arc<BacklogFilter>,
        messages: Arc<dyn MessageStore>,
    ) -> Self {
        Self {
            echoes,
            backlog,
            messages,
            seen: Mutex::new(HashMap::new()),
            duplicate_window_ms: cfg.duplicate_window_secs as i64 * 1000,
            echo_id_window_ms: cfg.echo_id_window_secs as i64 * 1000,
            log_probe_delay: std::time::Duration::from_millis(cfg.log_probe_delay_ms),
        }
    }

    /// Classify one inbound event. Guards run in priority order; the first
    /// match wins.
    pub async fn classify(&self, event: &InboundEvent) -> Classification {
        // State-change and label events skip message reconciliation
        // entirely; the engine routes them by kind.
        if !matches!(event.kind, EventKind::Message) {
            return Classification::Ignored;
        }

        if let Some(verdict) = self.guard_backlog_baseline(event) {
            return verdict;
        }
        if let Some(verdict) = self.guard_self_originated(event).await {
            return verdict;
        }
        if let Some(verdict) = self.guard_duplicate(event) {
            return verdict;
        }
        if let Some(verdict) = self.guard_wall_clock_age(event) {
            return verdict;
        }
        if let Some(verdict) = self.guard_failsafe_echo(event) {
            return verdict;
        }
        Classification::UserMessage
    }

    /// Guard 1: events older than the channel's processing baseline are
    /// backlog, regardless of anything else about them.
    fn guard_backlog_baseline(&self, event: &InboundEvent) -> Option<Classification> {
        self.backlog
            .is_backlog(&event.channel_id, event.timestamp_secs)
            .then_some(Classification::Backlog)
    }

    /// Guard 2: the gateway marked the event as outbound-originated. Three
    /// echo probes, cheapest first; whatever the probes cannot claim was
    /// typed by a human operator — unless sender and recipient are the
    /// same identity, which is a self-test and rides the user path.
    async fn guard_self_originated(&self, event: &InboundEvent) -> Option<Classification> {
        if !event.is_outbound_echo {
            return None;
        }

        // Exact message-id match: authoritative and cheap.
        if self.echoes.matches_id(&event.message_id) {
            return Some(Classification::SelfEcho);
        }

        // Normalized-text similarity against recent replies to this
        // recipient, tolerating gateway reformatting.
        let normalized = event.normalized_body();
        if self.echoes.matches_text(&event.to_id, &normalized) {
            return Some(Classification::SelfEcho);
        }

        // A concurrently in-flight own-reply may not have reached the
        // registry-backed log yet; give it a moment, then probe the
        // durable record for an automation-authored match.
        if !normalized.is_empty() {
            tokio::time::sleep(self.log_probe_delay).await;
            let since = now_ms() - self.echo_id_window_ms;
            let logged = self
                .messages
                .automation_sent_since(&event.conversation_key(), &normalized, since)
                .await
                .unwrap_or(false);
            if logged {
                return Some(Classification::SelfEcho);
            }
        }

        if event.is_self_chat() {
            return Some(Classification::UserMessage);
        }
        Some(Classification::AdminMessage)
    }

    /// Guard 3: a message id already classified recently. Only inbound
    /// events carry redelivery risk; outbound echoes never reach here.
    fn guard_duplicate(&self, event: &InboundEvent) -> Option<Classification> {
        let seen = self.seen.lock();
        let classified_at = seen.get(&event.message_id)?;
        (now_ms() - classified_at <= self.duplicate_window_ms).then_some(Classification::Duplicate)
    }

    /// Guard 4: wall-clock staleness, re-validated even for channels whose
    /// baseline is long-lived.
    fn guard_wall_clock_age(&self, event: &InboundEvent) -> Option<Classification> {
        self.backlog
            .is_stale(event.timestamp_secs)
            .then_some(Classification::Backlog)
    }

    /// Guard 5: some gateways echo the bot's own sends back as ordinary
    /// inbound events without the outbound flag. A very recent reply with
    /// the same normalized text to this sender is ours.
    fn guard_failsafe_echo(&self, event: &InboundEvent) -> Option<Classification> {
        self.echoes
            .matches_text(&event.from_id, &event.normalized_body())
            .then_some(Classification::SelfEcho)
    }

    /// Record that this message id has been classified and acted upon.
    /// Called by the engine, never by `classify` itself.
    pub fn note_classified(&self, message_id: &str) {
        self.seen.lock().insert(message_id.to_string(), now_ms());
    }

    /// Prune expired duplicate-ledger entries on the maintenance tick.
    pub fn sweep(&self) {
        let cutoff = now_ms() - self.duplicate_window_ms;
        self.seen.lock().retain(|_, at| *at > cutoff);
    }

    #[cfg(test)]
    fn seen_len(&self) -> usize {
        self.seen.lock().len()
    }
}
