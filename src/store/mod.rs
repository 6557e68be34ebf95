//! Durable records the engine reads and writes: the message append-log,
//! conversation locks, and channel session rows.
//!
//! Everything in-memory (echo registry, lock cache, debounce buffers) is
//! rebuildable from this layer after a restart. The lock table is the only
//! cross-process-safe authority on handover state.

pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::event::ConversationKey;

pub use sqlite::SqliteStore;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Who authored a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Author {
    User,
    Operator,
    Automation,
    /// Audit entries the system writes about itself (errors, silent turns,
    /// policy rejections). Never sent to anyone.
    System,
}

impl Author {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Operator => "operator",
            Self::Automation => "automation",
            Self::System => "system",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Self::User),
            "operator" => Some(Self::Operator),
            "automation" => Some(Self::Automation),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// One row of the per-conversation append-log.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub channel_id: String,
    pub participant_id: String,
    /// Gateway message id when known; audit entries have none.
    pub message_id: Option<String>,
    pub author: Author,
    pub body: String,
    pub normalized_body: String,
    pub created_at_ms: i64,
}

impl StoredMessage {
    pub fn key(&self) -> ConversationKey {
        ConversationKey::new(self.channel_id.clone(), self.participant_id.clone())
    }
}

/// What put a conversation lock in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockSource {
    Emoji,
    Label,
    AdminReply,
    OrderFlow,
}

impl LockSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Emoji => "emoji",
            Self::Label => "label",
            Self::AdminReply => "admin_reply",
            Self::OrderFlow => "order_flow",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "emoji" => Some(Self::Emoji),
            "label" => Some(Self::Label),
            "admin_reply" => Some(Self::AdminReply),
            "order_flow" => Some(Self::OrderFlow),
            _ => None,
        }
    }
}

/// Durable handover state for one conversation. The source of truth; the
/// in-memory cache in [`crate::engine::lock::ConversationLock`] is only an
/// optimization over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockState {
    /// `None` means locked indefinitely until explicitly cleared.
    pub locked_until_ms: Option<i64>,
    pub source: LockSource,
}

impl LockState {
    pub fn active_at(&self, now_ms: i64) -> bool {
        self.locked_until_ms.is_none_or(|until| until > now_ms)
    }
}

/// Coarse lifecycle state of a connected channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Trial,
    Suspended,
    Expired,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trial => "trial",
            Self::Suspended => "suspended",
            Self::Expired => "expired",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(Self::Active),
            "trial" => Some(Self::Trial),
            "suspended" => Some(Self::Suspended),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Map a gateway connectivity status string onto the session lifecycle.
    pub fn from_gateway_state(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "open" | "connected" | "authenticated" | "ready" => Some(Self::Active),
            "trial" => Some(Self::Trial),
            "banned" | "suspended" => Some(Self::Suspended),
            "expired" | "logged_out" | "disconnected" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// One row per connected channel. The engine only derives a coarse
/// "may this channel auto-reply" signal from it.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub channel_id: String,
    pub status: SessionStatus,
    /// Remaining reply allowance; `None` means unmetered.
    pub allowance: Option<i64>,
}

impl SessionRecord {
    pub fn allows_auto_reply(&self) -> bool {
        let status_ok = matches!(self.status, SessionStatus::Active | SessionStatus::Trial);
        status_ok && self.allowance.is_none_or(|n| n > 0)
    }
}

/// Append-log of every message exchanged with a conversation.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(&self, record: StoredMessage) -> Result<()>;
    /// Most recent messages for a conversation, newest first.
    async fn recent(&self, key: &ConversationKey, limit: u32) -> Result<Vec<StoredMessage>>;
    async fn find_by_message_id(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<Option<StoredMessage>>;
    /// Whether an automation-authored record with this normalized body was
    /// appended for this conversation at or after `since_ms`.
    async fn automation_sent_since(
        &self,
        key: &ConversationKey,
        normalized_body: &str,
        since_ms: i64,
    ) -> Result<bool>;
}

/// Durable conversation lock records.
#[async_trait]
pub trait LockStore: Send + Sync {
    async fn get_lock(&self, key: &ConversationKey) -> Result<Option<LockState>>;
    async fn set_lock(&self, key: &ConversationKey, state: LockState) -> Result<()>;
    async fn clear_lock(&self, key: &ConversationKey) -> Result<()>;
}

/// Channel session rows (status + usage allowance).
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_session(&self, channel_id: &str) -> Result<Option<SessionRecord>>;
    async fn upsert_status(&self, channel_id: &str, status: SessionStatus) -> Result<()>;
    async fn set_allowance(&self, channel_id: &str, allowance: Option<i64>) -> Result<()>;
    async fn decrement_allowance(&self, channel_id: &str) -> Result<()>;
}
