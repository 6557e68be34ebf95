//! Coalesces rapid-fire user messages into one conversational turn.
//!
//! Each enqueue appends to the conversation's buffer and restarts its quiet
//! timer. When the timer fires the buffer is detached from the map under the
//! lock, so an enqueue racing the release either lands in the released batch
//! (before the detach) or opens a fresh buffer (after it) — never both,
//! never lost. A timer superseded by a later enqueue finds a newer epoch and
//! becomes a no-op, which makes cancellation idempotent: exactly one release
//! per buffer lifetime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::engine::event::{ConversationKey, InboundEvent, MediaRef, QuotedRef};

/// One buffered user message awaiting its turn.
#[derive(Debug, Clone)]
pub struct BufferedMessage {
    pub message_id: String,
    pub body: String,
    pub media_refs: Vec<MediaRef>,
    pub quoted: Option<QuotedRef>,
    pub timestamp_secs: i64,
    pub push_name: Option<String>,
}

impl BufferedMessage {
    pub fn from_event(event: &InboundEvent) -> Self {
        Self {
            message_id: event.message_id.clone(),
            body: event.body.clone(),
            media_refs: event.media_refs.clone(),
            quoted: event.quoted.clone(),
            timestamp_secs: event.timestamp_secs,
            push_name: event.push_name.clone(),
        }
    }
}

/// Consumer of released batches. Implemented by the turn processor; tests
/// plug in recorders.
#[async_trait]
pub trait TurnSink: Send + Sync {
    async fn process(&self, key: ConversationKey, batch: Vec<BufferedMessage>);
}

struct Buffer {
    pending: Vec<BufferedMessage>,
    /// Bumped on every enqueue; a release task only fires if its epoch is
    /// still current when the timer expires.
    epoch: u64,
}

pub struct DebounceAggregator {
    buffers: Arc<Mutex<HashMap<ConversationKey, Buffer>>>,
    sink: Arc<dyn TurnSink>,
}

impl DebounceAggregator {
    pub fn new(sink: Arc<dyn TurnSink>) -> Self {
        Self {
            buffers: Arc::new(Mutex::new(HashMap::new())),
            sink,
        }
    }

    /// Append to the conversation's buffer and (re)start its quiet timer.
    /// `wait` is the per-channel debounce duration, already clamped.
    pub fn enqueue(&self, key: ConversationKey, message: BufferedMessage, wait: Duration) {
        let epoch = {
            let mut buffers = self.buffers.lock();
            let buffer = buffers.entry(key.clone()).or_insert_with(|| Buffer {
                pending: Vec::new(),
                epoch: 0,
            });
            buffer.pending.push(message);
            buffer.epoch += 1;
            buffer.epoch
        };

        let buffers = Arc::clone(&self.buffers);
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let batch = {
                let mut buffers = buffers.lock();
                match buffers.get(&key) {
                    // Still the newest timer for this key: detach atomically.
                    Some(buffer) if buffer.epoch == epoch => {
                        buffers.remove(&key).map(|b| b.pending)
                    }
                    // Superseded or already released: cancelled, no-op.
                    _ => None,
                }
            };
            if let Some(batch) = batch {
                sink.process(key, batch).await;
            }
        });
    }

    /// Number of conversations with an open buffer.
    pub fn open_buffers(&self) -> usize {
        self.buffers.lock().len()
    }
}
