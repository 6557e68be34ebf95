//! Consumes debounced batches and produces at most one reply per batch.
//!
//! Every step is a potential early exit, and the first two re-validate
//! state that may have changed during the debounce wait: the handover lock
//! (a human may have replied while the batch was buffering) and the
//! channel's authorization. Failures anywhere are caught at the top,
//! audited against the conversation, and never escape — one conversation's
//! bad turn must not disturb another's buffers or locks.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::channels::{ChannelTransport, LabelClient, PresenceKind};
use crate::config::HandoverConfig;
use crate::engine::debounce::{BufferedMessage, TurnSink};
use crate::engine::directives::{parse_reply, Directive};
use crate::engine::echo::EchoRegistry;
use crate::engine::event::ConversationKey;
use crate::engine::lock::ConversationLock;
use crate::observability::{Observer, ObserverEvent};
use crate::providers::{ChatMessage, GeneratedReply, ResponseGenerator};
use crate::store::{
    Author, LockSource, MessageStore, SessionStore, StoredMessage,
};
use crate::util::{normalize_text, now_ms, truncate_with_ellipsis};

/// Substituted when media analysis fails or returns nothing, so a turn is
/// never dropped for having "no analyzable text".
const MEDIA_PLACEHOLDER: &str = "[media attachment]";

/// How much stored history rides along to the generator.
const HISTORY_DEPTH: u32 = 20;

pub struct TurnProcessor {
    locks: Arc<ConversationLock>,
    sessions: Arc<dyn SessionStore>,
    messages: Arc<dyn MessageStore>,
    echoes: Arc<EchoRegistry>,
    transport: Arc<dyn ChannelTransport>,
    labels: Arc<dyn LabelClient>,
    generator: Arc<dyn ResponseGenerator>,
    observer: Arc<dyn Observer>,
    handover: HandoverConfig,
}

impl TurnProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        locks: Arc<ConversationLock>,
        sessions: Arc<dyn SessionStore>,
        messages: Arc<dyn MessageStore>,
        echoes: Arc<EchoRegistry>,
        transport: Arc<dyn ChannelTransport>,
        labels: Arc<dyn LabelClient>,
        generator: Arc<dyn ResponseGenerator>,
        observer: Arc<dyn Observer>,
        handover: HandoverConfig,
    ) -> Self {
        Self {
            locks,
            sessions,
            messages,
            echoes,
            transport,
            labels,
            generator,
            observer,
            handover,
        }
    }

    async fn run(&self, key: &ConversationKey, batch: Vec<BufferedMessage>) -> Result<()> {
        // Step 1: the careful lock re-check. A human may have taken the
        // conversation over while this batch sat in the debounce buffer;
        // the healed check also repairs cache/durable drift before the
        // decision is made.
        if self.locks.is_locked_healed(key).await? {
            self.reject(key, "handover lock active").await;
            return Ok(());
        }

        // Step 2: channel-level authorization. Absent session rows read as
        // allowed — the session directory belongs to a collaborator and
        // its absence must not silence every conversation.
        if let Some(session) = self.sessions.get_session(&key.channel_id).await? {
            if !session.allows_auto_reply() {
                self.reject(key, "channel not authorized for auto-reply").await;
                return Ok(());
            }
        }

        let _ = self
            .transport
            .send_presence(&key.channel_id, &key.participant_id, PresenceKind::Typing)
            .await;

        // Step 3: merge the batch into one logical turn.
        let turn_text = self.assemble_turn(key, &batch).await;

        // Step 4: invoke the generator. `None` is a deliberate silence.
        let history = self.load_history(key).await?;
        let reply = match self.generator.generate(&turn_text, &history).await {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                self.observer
                    .record_event(&ObserverEvent::SilentTurn { key: key.clone() });
                self.audit(key, "generator declined to reply").await;
                return Ok(());
            }
            Err(e) => {
                self.audit(key, &format!("generator failed: {e:#}")).await;
                self.observer.record_event(&ObserverEvent::Error {
                    component: "generator".into(),
                    message: e.to_string(),
                });
                return Ok(());
            }
        };

        if let (Some(input), Some(output)) =
            (reply.usage.input_tokens, reply.usage.output_tokens)
        {
            info!(conversation = %key, model = %reply.model_id, input, output, "usage");
        }

        // Step 5: act on control directives and strip them from the text.
        let parsed = parse_reply(&reply.text);
        self.apply_directives(key, &parsed.directives).await?;

        // Step 6: agent-initiated handover carries the same semantics as an
        // operator's emoji.
        if self.handover.contains_unlock_emoji(&parsed.clean_text) {
            self.locks.unlock(key).await?;
            self.lock_changed(key, false, "agent unlock emoji");
        } else if self.handover.contains_lock_emoji(&parsed.clean_text) {
            self.locks
                .lock(key, self.handover.emoji_ttl_secs, LockSource::Emoji)
                .await?;
            self.lock_changed(key, true, "agent lock emoji");
        }

        // Step 7: send text, then media, registering each with the echo
        // registry before its send call returns.
        self.dispatch(key, &parsed.clean_text, &reply).await?;

        // Step 8: persist the outbound turn and settle usage.
        self.sessions.decrement_allowance(&key.channel_id).await?;
        Ok(())
    }

    async fn dispatch(
        &self,
        key: &ConversationKey,
        clean_text: &str,
        reply: &GeneratedReply,
    ) -> Result<()> {
        let mut sent_id: Option<String> = None;
        if !clean_text.trim().is_empty() {
            let normalized = normalize_text(clean_text);
            // Registered before the send call so the gateway's reflection
            // cannot outrun it.
            self.echoes.record(&key.participant_id, &normalized, None);
            sent_id = self
                .transport
                .send_text(&key.channel_id, &key.participant_id, clean_text)
                .await
                .context("text send failed")?;
            if let Some(id) = &sent_id {
                self.echoes.record(&key.participant_id, "", Some(id));
            }
            self.observer.record_event(&ObserverEvent::ReplySent {
                key: key.clone(),
                chars: clean_text.chars().count(),
            });
        }

        for media in &reply.media {
            let caption_norm = media.caption.as_deref().map(normalize_text).unwrap_or_default();
            self.echoes.record(&key.participant_id, &caption_norm, None);
            let media_id = self
                .transport
                .send_media(
                    &key.channel_id,
                    &key.participant_id,
                    &media.url,
                    media.caption.as_deref(),
                )
                .await
                .context("media send failed")?;
            if let Some(id) = &media_id {
                self.echoes.record(&key.participant_id, "", Some(id));
            }
        }

        if !clean_text.trim().is_empty() {
            self.messages
                .append(StoredMessage {
                    channel_id: key.channel_id.clone(),
                    participant_id: key.participant_id.clone(),
                    message_id: sent_id,
                    author: Author::Automation,
                    body: clean_text.to_string(),
                    normalized_body: normalize_text(clean_text),
                    created_at_ms: now_ms(),
                })
                .await?;
        }
        Ok(())
    }

    async fn apply_directives(
        &self,
        key: &ConversationKey,
        directives: &[Directive],
    ) -> Result<()> {
        for directive in directives {
            match directive {
                Directive::OrderCapture(details) => {
                    self.audit(key, &format!("order captured: {details}")).await;
                    if self.handover.lock_on_order {
                        self.locks
                            .lock(key, self.handover.emoji_ttl_secs, LockSource::OrderFlow)
                            .await?;
                        self.lock_changed(key, true, "order captured");
                    }
                }
                Directive::AssignLabel(name) => {
                    if let Err(e) = self
                        .labels
                        .apply_label(&key.channel_id, &key.participant_id, name)
                        .await
                    {
                        warn!(conversation = %key, label = %name, "label assignment failed: {e:#}");
                    }
                    if self.handover.is_blocking_label(name) {
                        self.locks
                            .lock(key, self.handover.label_ttl_secs, LockSource::Label)
                            .await?;
                        self.lock_changed(key, true, "blocking label assigned");
                    }
                }
            }
        }
        Ok(())
    }

    /// Concatenate bodies in arrival order, resolving quoted references
    /// against stored text and media into textual descriptions.
    async fn assemble_turn(&self, key: &ConversationKey, batch: &[BufferedMessage]) -> String {
        let mut parts: Vec<String> = Vec::new();
        for message in batch {
            if let Some(quoted) = &message.quoted {
                if let Some(text) = self.resolve_quoted(key, quoted).await {
                    parts.push(format!("> {text}"));
                }
            }
            if !message.body.trim().is_empty() {
                parts.push(message.body.clone());
            }
            for media in &message.media_refs {
                let description = match self.generator.describe_media(media).await {
                    Ok(text) if !text.trim().is_empty() => text,
                    Ok(_) => MEDIA_PLACEHOLDER.to_string(),
                    Err(e) => {
                        warn!(conversation = %key, "media analysis failed: {e:#}");
                        MEDIA_PLACEHOLDER.to_string()
                    }
                };
                parts.push(description);
            }
        }
        parts.join("\n")
    }

    async fn resolve_quoted(
        &self,
        key: &ConversationKey,
        quoted: &crate::engine::event::QuotedRef,
    ) -> Option<String> {
        if let Some(id) = &quoted.message_id {
            if let Ok(Some(stored)) = self.messages.find_by_message_id(&key.channel_id, id).await {
                return Some(stored.body);
            }
        }
        // Fall back to whatever quoted text rode along in the payload.
        quoted.body.clone()
    }

    async fn load_history(&self, key: &ConversationKey) -> Result<Vec<ChatMessage>> {
        let recent = self.messages.recent(key, HISTORY_DEPTH).await?;
        // Newest-first from the store; the generator wants chronological.
        let mut history: Vec<ChatMessage> = recent
            .iter()
            .rev()
            .filter_map(|msg| match msg.author {
                Author::User => Some(ChatMessage::user(msg.body.clone())),
                Author::Automation | Author::Operator => {
                    Some(ChatMessage::assistant(msg.body.clone()))
                }
                Author::System => None,
            })
            .collect();
        // The current batch is already the final user turn; trailing user
        // messages would reach the generator twice.
        while history.last().is_some_and(|m| m.role == "user") {
            history.pop();
        }
        Ok(history)
    }

    async fn reject(&self, key: &ConversationKey, reason: &str) {
        self.observer.record_event(&ObserverEvent::PolicyRejection {
            key: key.clone(),
            reason: reason.to_string(),
        });
        self.audit(key, reason).await;
    }

    /// Write a system-visible audit record attributed to the conversation.
    async fn audit(&self, key: &ConversationKey, note: &str) {
        let record = StoredMessage {
            channel_id: key.channel_id.clone(),
            participant_id: key.participant_id.clone(),
            message_id: None,
            author: Author::System,
            body: truncate_with_ellipsis(note, 500),
            normalized_body: String::new(),
            created_at_ms: now_ms(),
        };
        if let Err(e) = self.messages.append(record).await {
            warn!(conversation = %key, "audit append failed: {e:#}");
        }
    }

    fn lock_changed(&self, key: &ConversationKey, locked: bool, reason: &str) {
        self.observer.record_event(&ObserverEvent::LockChanged {
            key: key.clone(),
            locked,
            reason: reason.to_string(),
        });
    }
}

#[async_trait]
impl TurnSink for TurnProcessor {
    async fn process(&self, key: ConversationKey, batch: Vec<BufferedMessage>) {
        let turn_id = uuid::Uuid::new_v4();
        info!(conversation = %key, turn = %turn_id, batch = batch.len(), "processing turn");
        self.observer.record_event(&ObserverEvent::TurnStarted {
            key: key.clone(),
            batch_len: batch.len(),
        });
        if let Err(e) = self.run(&key, batch).await {
            warn!(conversation = %key, turn = %turn_id, "turn failed: {e:#}");
            self.observer.record_event(&ObserverEvent::Error {
                component: "turn".into(),
                message: e.to_string(),
            });
            self.audit(&key, &format!("turn failed: {e:#}")).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::event::{MediaRef, QuotedRef};
    use crate::observability::testing::RecordingObserver;
    use crate::providers::OutboundMedia;
    use crate::store::{LockStore, SessionStatus, SqliteStore};
    use parking_lot::Mutex;

    // ── fakes ─────────────────────────────────────────────────────

    #[derive(Default)]
    struct FakeGenerator {
        reply: Mutex<Option<GeneratedReply>>,
        fail: Mutex<bool>,
        media_fail: Mutex<bool>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeGenerator {
        fn with_text(text: &str) -> Self {
            let gen = Self::default();
            *gen.reply.lock() = Some(GeneratedReply {
                text: text.into(),
                media: vec![],
                usage: Default::default(),
                model_id: "fake".into(),
            });
            gen
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl ResponseGenerator for FakeGenerator {
        async fn generate(
            &self,
            turn_text: &str,
            _history: &[ChatMessage],
        ) -> anyhow::Result<Option<GeneratedReply>> {
            self.calls.lock().push(turn_text.to_string());
            if *self.fail.lock() {
                anyhow::bail!("provider unavailable");
            }
            Ok(self.reply.lock().clone())
        }

        async fn describe_media(&self, media: &MediaRef) -> anyhow::Result<String> {
            if *self.media_fail.lock() {
                anyhow::bail!("vision model unavailable");
            }
            Ok(format!("photo of {}", media.url))
        }
    }

    #[derive(Default)]
    struct FakeTransport {
        texts: Mutex<Vec<(String, String)>>,
        media: Mutex<Vec<(String, Option<String>)>>,
    }

    #[async_trait]
    impl ChannelTransport for FakeTransport {
        fn name(&self) -> &str {
            "fake"
        }

        async fn send_text(
            &self,
            _channel_id: &str,
            recipient_id: &str,
            text: &str,
        ) -> anyhow::Result<Option<String>> {
            self.texts.lock().push((recipient_id.into(), text.into()));
            Ok(Some(format!("sent-{}", self.texts.lock().len())))
        }

        async fn send_media(
            &self,
            _channel_id: &str,
            _recipient_id: &str,
            url: &str,
            caption: Option<&str>,
        ) -> anyhow::Result<Option<String>> {
            self.media
                .lock()
                .push((url.into(), caption.map(ToString::to_string)));
            Ok(None)
        }
    }

    #[derive(Default)]
    struct FakeLabels {
        applied: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LabelClient for FakeLabels {
        async fn get_labels(
            &self,
            _channel_id: &str,
            _participant_id: &str,
        ) -> anyhow::Result<Vec<String>> {
            Ok(self.applied.lock().clone())
        }

        async fn apply_label(
            &self,
            _channel_id: &str,
            _participant_id: &str,
            name: &str,
        ) -> anyhow::Result<()> {
            self.applied.lock().push(name.to_string());
            Ok(())
        }
    }

    struct Fixture {
        processor: TurnProcessor,
        store: Arc<SqliteStore>,
        echoes: Arc<EchoRegistry>,
        locks: Arc<ConversationLock>,
        transport: Arc<FakeTransport>,
        labels: Arc<FakeLabels>,
        generator: Arc<FakeGenerator>,
        observer: Arc<RecordingObserver>,
    }

    fn fixture(generator: FakeGenerator) -> Fixture {
        let cfg = EngineConfig::default();
        let handover = HandoverConfig::default();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let echoes = Arc::new(EchoRegistry::new(&cfg));
        let locks = Arc::new(ConversationLock::new(
            &cfg,
            handover.clone(),
            store.clone(),
            store.clone(),
        ));
        let transport = Arc::new(FakeTransport::default());
        let labels = Arc::new(FakeLabels::default());
        let generator = Arc::new(generator);
        let observer = Arc::new(RecordingObserver::default());
        let processor = TurnProcessor::new(
            locks.clone(),
            store.clone(),
            store.clone(),
            echoes.clone(),
            transport.clone(),
            labels.clone(),
            generator.clone(),
            observer.clone(),
            handover,
        );
        Fixture {
            processor,
            store,
            echoes,
            locks,
            transport,
            labels,
            generator,
            observer,
        }
    }

    fn key() -> ConversationKey {
        ConversationKey::new("ch1", "+111")
    }

    fn msg(body: &str) -> BufferedMessage {
        BufferedMessage {
            message_id: format!("mid-{body}"),
            body: body.into(),
            media_refs: vec![],
            quoted: None,
            timestamp_secs: now_ms() / 1000,
            push_name: None,
        }
    }

    #[tokio::test]
    async fn happy_path_sends_reply_and_persists() {
        let fx = fixture(FakeGenerator::with_text("Hello from the bot"));
        fx.processor.process(key(), vec![msg("hi")]).await;

        let texts = fx.transport.texts.lock();
        assert_eq!(texts.len(), 1);
        assert_eq!(texts[0].1, "Hello from the bot");
        drop(texts);

        // Echo registry saw the send before the call returned.
        assert!(fx
            .echoes
            .matches_text("+111", &normalize_text("Hello from the bot")));
        assert!(fx.echoes.matches_id("sent-1"));

        // Outbound turn persisted as automation-authored.
        let recent = fx.store.recent(&key(), 5).await.unwrap();
        assert!(recent
            .iter()
            .any(|m| m.author == Author::Automation && m.body == "Hello from the bot"));
    }

    #[tokio::test]
    async fn locked_conversation_never_reaches_generator() {
        let fx = fixture(FakeGenerator::with_text("should not appear"));
        fx.locks.lock(&key(), 3600, LockSource::Emoji).await.unwrap();

        fx.processor.process(key(), vec![msg("hi")]).await;

        assert_eq!(fx.generator.call_count(), 0);
        assert!(fx.transport.texts.lock().is_empty());
        let events = fx.observer.events.lock();
        assert!(events
            .iter()
            .any(|e| matches!(e, ObserverEvent::PolicyRejection { .. })));
    }

    #[tokio::test]
    async fn suspended_channel_is_rejected() {
        let fx = fixture(FakeGenerator::with_text("nope"));
        fx.store
            .upsert_status("ch1", SessionStatus::Suspended)
            .await
            .unwrap();

        fx.processor.process(key(), vec![msg("hi")]).await;

        assert_eq!(fx.generator.call_count(), 0);
        assert!(fx.transport.texts.lock().is_empty());
    }

    #[tokio::test]
    async fn exhausted_allowance_is_rejected() {
        let fx = fixture(FakeGenerator::with_text("nope"));
        fx.store.upsert_status("ch1", SessionStatus::Active).await.unwrap();
        fx.store.set_allowance("ch1", Some(0)).await.unwrap();

        fx.processor.process(key(), vec![msg("hi")]).await;
        assert_eq!(fx.generator.call_count(), 0);
    }

    #[tokio::test]
    async fn allowance_decremented_after_reply() {
        let fx = fixture(FakeGenerator::with_text("ok"));
        fx.store.upsert_status("ch1", SessionStatus::Active).await.unwrap();
        fx.store.set_allowance("ch1", Some(5)).await.unwrap();

        fx.processor.process(key(), vec![msg("hi")]).await;
        let session = fx.store.get_session("ch1").await.unwrap().unwrap();
        assert_eq!(session.allowance, Some(4));
    }

    #[tokio::test]
    async fn silent_turn_audited_not_sent() {
        let fx = fixture(FakeGenerator::default()); // reply = None
        fx.processor.process(key(), vec![msg("hi")]).await;

        assert!(fx.transport.texts.lock().is_empty());
        let events = fx.observer.events.lock();
        assert!(events.iter().any(|e| matches!(e, ObserverEvent::SilentTurn { .. })));
        drop(events);
        let recent = fx.store.recent(&key(), 5).await.unwrap();
        assert!(recent.iter().any(|m| m.author == Author::System));
    }

    #[tokio::test]
    async fn generator_failure_is_contained() {
        let fx = fixture(FakeGenerator::with_text("unused"));
        *fx.generator.fail.lock() = true;

        fx.processor.process(key(), vec![msg("hi")]).await;

        assert!(fx.transport.texts.lock().is_empty());
        assert!(fx.observer.count_errors() >= 1);
        let recent = fx.store.recent(&key(), 5).await.unwrap();
        assert!(recent.iter().any(|m| m.author == Author::System));
    }

    #[tokio::test]
    async fn batch_merged_in_arrival_order() {
        let fx = fixture(FakeGenerator::with_text("ok"));
        fx.processor
            .process(key(), vec![msg("first"), msg("second"), msg("third")])
            .await;

        let calls = fx.generator.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], "first\nsecond\nthird");
    }

    #[tokio::test]
    async fn quoted_message_resolved_from_store() {
        let fx = fixture(FakeGenerator::with_text("ok"));
        fx.store
            .append(StoredMessage {
                channel_id: "ch1".into(),
                participant_id: "+111".into(),
                message_id: Some("orig-1".into()),
                author: Author::Automation,
                body: "We open at 9am".into(),
                normalized_body: normalize_text("We open at 9am"),
                created_at_ms: now_ms() - 60_000,
            })
            .await
            .unwrap();

        let mut m = msg("and on sundays?");
        m.quoted = Some(QuotedRef {
            message_id: Some("orig-1".into()),
            body: None,
        });
        fx.processor.process(key(), vec![m]).await;

        let calls = fx.generator.calls.lock();
        assert!(calls[0].starts_with("> We open at 9am\n"));
    }

    #[tokio::test]
    async fn quoted_fallback_to_payload_body() {
        let fx = fixture(FakeGenerator::with_text("ok"));
        let mut m = msg("yes that one");
        m.quoted = Some(QuotedRef {
            message_id: Some("never-stored".into()),
            body: Some("carried in payload".into()),
        });
        fx.processor.process(key(), vec![m]).await;

        let calls = fx.generator.calls.lock();
        assert!(calls[0].starts_with("> carried in payload\n"));
    }

    #[tokio::test]
    async fn media_described_inline() {
        let fx = fixture(FakeGenerator::with_text("ok"));
        let mut m = msg("");
        m.media_refs = vec![MediaRef {
            url: "https://cdn.example/cat.jpg".into(),
            mime_type: Some("image/jpeg".into()),
        }];
        fx.processor.process(key(), vec![m]).await;

        let calls = fx.generator.calls.lock();
        assert_eq!(calls[0], "photo of https://cdn.example/cat.jpg");
    }

    #[tokio::test]
    async fn media_placeholder_on_analysis_failure() {
        let fx = fixture(FakeGenerator::with_text("ok"));
        *fx.generator.media_fail.lock() = true;
        let mut m = msg("");
        m.media_refs = vec![MediaRef {
            url: "https://cdn.example/cat.jpg".into(),
            mime_type: None,
        }];
        fx.processor.process(key(), vec![m]).await;

        let calls = fx.generator.calls.lock();
        assert_eq!(calls[0], MEDIA_PLACEHOLDER);
        // The turn still ran: not silently dropped.
        assert_eq!(fx.transport.texts.lock().len(), 1);
    }

    #[tokio::test]
    async fn order_directive_stripped_and_locks() {
        let fx = fixture(FakeGenerator::with_text(
            "Order confirmed!\n[ORDER]2x espresso, pickup 10:00[/ORDER]",
        ));
        fx.processor.process(key(), vec![msg("two espressos please")]).await;

        let texts = fx.transport.texts.lock();
        assert_eq!(texts[0].1, "Order confirmed!");
        drop(texts);

        assert!(fx.locks.is_locked(&key()).await.unwrap());
        let lock = fx.store.get_lock(&key()).await.unwrap().unwrap();
        assert_eq!(lock.source, LockSource::OrderFlow);
        let recent = fx.store.recent(&key(), 10).await.unwrap();
        assert!(recent
            .iter()
            .any(|m| m.author == Author::System && m.body.contains("order captured")));
    }

    #[tokio::test]
    async fn blocking_label_directive_applies_and_locks() {
        let fx = fixture(FakeGenerator::with_text(
            "Connecting you to a specialist. [LABEL: support]",
        ));
        fx.processor.process(key(), vec![msg("I need a human")]).await;

        assert_eq!(fx.labels.applied.lock().as_slice(), ["support"]);
        assert!(fx.locks.is_locked(&key()).await.unwrap());
        let texts = fx.transport.texts.lock();
        assert!(!texts[0].1.contains("[LABEL"));
    }

    #[tokio::test]
    async fn non_blocking_label_does_not_lock() {
        let fx = fixture(FakeGenerator::with_text("Noted. [LABEL: vip]"));
        fx.processor.process(key(), vec![msg("hi")]).await;

        assert_eq!(fx.labels.applied.lock().as_slice(), ["vip"]);
        assert!(!fx.locks.is_locked(&key()).await.unwrap());
    }

    #[tokio::test]
    async fn agent_lock_emoji_engages_handover() {
        let fx = fixture(FakeGenerator::with_text(
            "A colleague will take it from here 🔒",
        ));
        fx.processor.process(key(), vec![msg("complex request")]).await;

        assert!(fx.locks.is_locked(&key()).await.unwrap());
        // The emoji itself still reaches the user.
        assert!(fx.transport.texts.lock()[0].1.contains('🔒'));
    }

    #[tokio::test]
    async fn agent_unlock_emoji_clears_lock() {
        let fx = fixture(FakeGenerator::with_text("I can help again 🔓"));
        fx.locks.lock(&key(), 3600, LockSource::AdminReply).await.unwrap();
        // An active lock blocks the turn, so clear it first to simulate the
        // generator being consulted while unlocked but emitting the emoji.
        fx.locks.unlock(&key()).await.unwrap();

        fx.processor.process(key(), vec![msg("hello?")]).await;
        assert!(!fx.locks.is_locked(&key()).await.unwrap());
    }

    #[tokio::test]
    async fn outbound_media_from_reply_is_sent() {
        let gen = FakeGenerator::default();
        *gen.reply.lock() = Some(GeneratedReply {
            text: "Here is our menu".into(),
            media: vec![OutboundMedia {
                url: "https://cdn.example/menu.pdf".into(),
                caption: Some("Menu".into()),
            }],
            usage: Default::default(),
            model_id: "fake".into(),
        });
        let fx = fixture(gen);
        fx.processor.process(key(), vec![msg("menu?")]).await;

        assert_eq!(fx.transport.texts.lock().len(), 1);
        let media = fx.transport.media.lock();
        assert_eq!(media.len(), 1);
        assert_eq!(media[0].0, "https://cdn.example/menu.pdf");
    }

    #[tokio::test]
    async fn history_excludes_system_records() {
        let fx = fixture(FakeGenerator::with_text("ok"));
        fx.store
            .append(StoredMessage {
                channel_id: "ch1".into(),
                participant_id: "+111".into(),
                message_id: None,
                author: Author::System,
                body: "audit noise".into(),
                normalized_body: String::new(),
                created_at_ms: now_ms() - 10_000,
            })
            .await
            .unwrap();
        let history = fx.processor.load_history(&key()).await.unwrap();
        assert!(history.iter().all(|m| m.content != "audit noise"));
    }
}
