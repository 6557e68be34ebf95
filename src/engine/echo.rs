//! Registry of replies this process just sent, used to recognize them when
//! the gateway reflects them back as inbound events.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::config::EngineConfig;
use crate::util::now_ms;

/// A recently-sent reply: "this exact text went to this recipient around
/// this time."
#[derive(Debug, Clone)]
struct EchoRecord {
    recipient_id: String,
    normalized_text: String,
    sent_at_ms: i64,
}

#[derive(Default)]
struct EchoInner {
    /// Message-id entries, authoritative and cheap to match.
    by_id: HashMap<String, i64>,
    /// Text entries, matched by normalized similarity within a short window.
    by_text: Vec<EchoRecord>,
}

/// Tracks outbound sends so their webhook reflections can be discarded.
///
/// Entries must be recorded BEFORE the network send call returns; the
/// recipient's platform can echo the send back as an inbound event while the
/// local call is still in flight. Two independent expiry windows apply:
/// message-id entries live `echo_id_window_secs` (default 10 min), text
/// entries live `echo_text_window_secs` (default 20 s). Expiry is lazy on
/// read and enforced by [`EchoRegistry::sweep`] on the maintenance tick so
/// memory stays bounded under sustained load.
pub struct EchoRegistry {
    inner: Mutex<EchoInner>,
    id_window_ms: i64,
    text_window_ms: i64,
}

impl EchoRegistry {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            inner: Mutex::new(EchoInner::default()),
            id_window_ms: cfg.echo_id_window_secs as i64 * 1000,
            text_window_ms: cfg.echo_text_window_secs as i64 * 1000,
        }
    }

    /// Record a reply that is about to be sent.
    pub fn record(&self, recipient_id: &str, normalized_text: &str, message_id: Option<&str>) {
        self.record_at(recipient_id, normalized_text, message_id, now_ms());
    }

    pub(crate) fn record_at(
        &self,
        recipient_id: &str,
        normalized_text: &str,
        message_id: Option<&str>,
        now: i64,
    ) {
        let mut inner = self.inner.lock();
        if let Some(id) = message_id {
            if !id.is_empty() {
                inner.by_id.insert(id.to_string(), now);
            }
        }
        if !normalized_text.is_empty() {
            inner.by_text.push(EchoRecord {
                recipient_id: recipient_id.to_string(),
                normalized_text: normalized_text.to_string(),
                sent_at_ms: now,
            });
        }
    }

    /// Exact message-id match. Authoritative: the gateway reflected back an
    /// id we generated.
    pub fn matches_id(&self, message_id: &str) -> bool {
        self.matches_id_at(message_id, now_ms())
    }

    pub(crate) fn matches_id_at(&self, message_id: &str, now: i64) -> bool {
        let inner = self.inner.lock();
        inner
            .by_id
            .get(message_id)
            .is_some_and(|sent| now - sent <= self.id_window_ms)
    }

    /// Normalized-text similarity match against replies sent to `recipient`
    /// within the text window. Exact equality always matches; containment in
    /// either direction matches once the text exceeds 5 characters, which
    /// tolerates gateways that reformat the sent text before echoing it.
    pub fn matches_text(&self, recipient_id: &str, normalized_text: &str) -> bool {
        self.matches_text_at(recipient_id, normalized_text, now_ms())
    }

    pub(crate) fn matches_text_at(&self, recipient_id: &str, normalized_text: &str, now: i64) -> bool {
        if normalized_text.is_empty() {
            return false;
        }
        let inner = self.inner.lock();
        inner.by_text.iter().any(|rec| {
            rec.recipient_id == recipient_id
                && now - rec.sent_at_ms <= self.text_window_ms
                && texts_similar(&rec.normalized_text, normalized_text)
        })
    }

    /// Drop expired entries. Called on the engine's maintenance tick.
    pub fn sweep(&self) {
        self.sweep_at(now_ms());
    }

    pub(crate) fn sweep_at(&self, now: i64) {
        let mut inner = self.inner.lock();
        let id_cutoff = now - self.id_window_ms;
        let text_cutoff = now - self.text_window_ms;
        inner.by_id.retain(|_, sent| *sent > id_cutoff);
        inner.by_text.retain(|rec| rec.sent_at_ms > text_cutoff);
    }

    #[cfg(test)]
    fn len(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.by_id.len(), inner.by_text.len())
    }
}

fn texts_similar(sent: &str, candidate: &str) -> bool {
    if sent == candidate {
        return true;
    }
    if sent.chars().count() > 5 && candidate.chars().count() > 5 {
        return sent.contains(candidate) || candidate.contains(sent);
    }
    false
}
