//! Per-conversation handover state: whether the automated agent is
//! currently authorized to reply.
//!
//! Two tiers. The durable record (see [`LockStore`]) is the source of
//! truth and survives restarts; the in-memory cache is only an
//! optimization and may be stale. Every read path is cache-then-fallback:
//! a fresh cache entry answers immediately, anything else consults the
//! durable record and repopulates the cache. A restarted process therefore
//! re-derives locks on first access instead of assuming unlocked.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;

use crate::config::{EngineConfig, HandoverConfig};
use crate::engine::event::ConversationKey;
use crate::store::{Author, LockSource, LockState, LockStore, MessageStore};
use crate::util::now_ms;

struct CachedLock {
    state: Option<LockState>,
    fetched_at_ms: i64,
}

pub struct ConversationLock {
    cache: Mutex<HashMap<ConversationKey, CachedLock>>,
    locks: Arc<dyn LockStore>,
    messages: Arc<dyn MessageStore>,
    handover: HandoverConfig,
    cache_ttl_ms: i64,
}

impl ConversationLock {
    pub fn new(
        engine: &EngineConfig,
        handover: HandoverConfig,
        locks: Arc<dyn LockStore>,
        messages: Arc<dyn MessageStore>,
    ) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            locks,
            messages,
            handover,
            cache_ttl_ms: engine.lock_cache_ttl_secs as i64 * 1000,
        }
    }

    /// Fast-path authorization check: fresh cache, else durable record.
    pub async fn is_locked(&self, key: &ConversationKey) -> Result<bool> {
        let now = now_ms();
        Ok(self.resolve(key, now).await?.is_some_and(|s| s.active_at(now)))
    }

    /// Resolve the current lock state, repopulating the cache from the
    /// durable record when the cached entry is absent or expired.
    async fn resolve(&self, key: &ConversationKey, now: i64) -> Result<Option<LockState>> {
        if let Some(cached) = self.cache_get(key, now) {
            return Ok(cached);
        }
        let durable = self.locks.get_lock(key).await?;
        self.cache_put(key, durable, now);
        Ok(durable)
    }

    /// Apply an explicit lock. Replaces whatever was in place.
    pub async fn lock(&self, key: &ConversationKey, ttl_secs: u64, source: LockSource) -> Result<()> {
        let now = now_ms();
        let state = LockState {
            locked_until_ms: Some(now + ttl_secs as i64 * 1000),
            source,
        };
        self.locks.set_lock(key, state).await?;
        self.cache_put(key, Some(state), now);
        Ok(())
    }

    /// Apply an implicit handover (operator replied without a control
    /// emoji). Never shortens a lock that is already in place.
    pub async fn lock_if_extends(
        &self,
        key: &ConversationKey,
        ttl_secs: u64,
        source: LockSource,
    ) -> Result<()> {
        let now = now_ms();
        let proposed_until = now + ttl_secs as i64 * 1000;
        let current = self.resolve(key, now).await?;
        if let Some(existing) = current {
            if existing.active_at(now) {
                let extends = existing
                    .locked_until_ms
                    .is_some_and(|until| proposed_until > until);
                if !extends {
                    return Ok(());
                }
            }
        }
        let state = LockState {
            locked_until_ms: Some(proposed_until),
            source,
        };
        self.locks.set_lock(key, state).await?;
        self.cache_put(key, Some(state), now);
        Ok(())
    }

    /// Clear the lock. An explicit unlock wins over every lock source.
    pub async fn unlock(&self, key: &ConversationKey) -> Result<()> {
        self.locks.clear_lock(key).await?;
        self.cache_put(key, None, now_ms());
        Ok(())
    }

    /// Self-healing check used at the careful decision point before a
    /// reply goes out: scan the recent message history for the latest
    /// operator/system lock or unlock emoji and let it correct drift
    /// between the tiers, then answer the authorization question.
    pub async fn is_locked_healed(&self, key: &ConversationKey) -> Result<bool> {
        let now = now_ms();
        if let Some(healed) = self.heal_from_history(key, now).await? {
            return Ok(healed.is_some_and(|s| s.active_at(now)));
        }
        Ok(self.resolve(key, now).await?.is_some_and(|s| s.active_at(now)))
    }

    /// Scan the most recent `history_scan_depth` stored messages for the
    /// latest lock/unlock emoji attributable to an operator or system
    /// message. Whichever occurred most recently wins and is written back
    /// to the durable record and the cache. Returns `None` when history
    /// holds no verdict (both tiers are left untouched).
    async fn heal_from_history(
        &self,
        key: &ConversationKey,
        now: i64,
    ) -> Result<Option<Option<LockState>>> {
        let recent = self
            .messages
            .recent(key, self.handover.history_scan_depth)
            .await?;

        // Newest first: the first control emoji we meet is the verdict.
        for msg in &recent {
            if msg.author == Author::User {
                continue;
            }
            if self.handover.contains_unlock_emoji(&msg.body) {
                self.locks.clear_lock(key).await?;
                self.cache_put(key, None, now);
                return Ok(Some(None));
            }
            if self.handover.contains_lock_emoji(&msg.body) {
                let until = msg.created_at_ms + self.handover.emoji_ttl_secs as i64 * 1000;
                if until <= now {
                    // The emoji lock already ran out; expiry is not drift.
                    return Ok(None);
                }
                let state = LockState {
                    locked_until_ms: Some(until),
                    source: LockSource::Emoji,
                };
                self.locks.set_lock(key, state).await?;
                self.cache_put(key, Some(state), now);
                return Ok(Some(Some(state)));
            }
        }
        Ok(None)
    }

    /// Drop expired cache entries. Called on the engine maintenance tick.
    pub fn sweep(&self) {
        let now = now_ms();
        self.cache
            .lock()
            .retain(|_, cached| now - cached.fetched_at_ms <= self.cache_ttl_ms);
    }

    fn cache_get(&self, key: &ConversationKey, now: i64) -> Option<Option<LockState>> {
        let cache = self.cache.lock();
        cache.get(key).and_then(|cached| {
            (now - cached.fetched_at_ms <= self.cache_ttl_ms).then_some(cached.state)
        })
    }

    fn cache_put(&self, key: &ConversationKey, state: Option<LockState>, now: i64) {
        self.cache.lock().insert(
            key.clone(),
            CachedLock {
                state,
                fetched_at_ms: now,
            },
        );
    }

    #[cfg(test)]
    pub(crate) fn drop_cache(&self) {
        self.cache.lock().clear();
    }
}
