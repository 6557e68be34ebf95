//! Sqlite-backed implementation of the message log, lock, and session stores.

use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use super::{
    Author, LockSource, LockState, LockStore, MessageStore, Result, SessionRecord, SessionStore,
    SessionStatus, StoredMessage,
};
use crate::engine::event::ConversationKey;

/// Single-connection store guarded by a mutex. Statements are short-lived
/// and indexed, so contention stays negligible at webhook rates.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel_id TEXT NOT NULL,
                participant_id TEXT NOT NULL,
                message_id TEXT,
                author TEXT NOT NULL,
                body TEXT NOT NULL,
                normalized_body TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages (channel_id, participant_id, created_at_ms DESC);
            CREATE INDEX IF NOT EXISTS idx_messages_message_id
                ON messages (channel_id, message_id);

            CREATE TABLE IF NOT EXISTS locks (
                channel_id TEXT NOT NULL,
                participant_id TEXT NOT NULL,
                locked_until_ms INTEGER,
                source TEXT NOT NULL,
                updated_at_ms INTEGER NOT NULL,
                PRIMARY KEY (channel_id, participant_id)
            );

            CREATE TABLE IF NOT EXISTS sessions (
                channel_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                allowance INTEGER,
                updated_at_ms INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
        let author_raw: String = row.get("author")?;
        Ok(StoredMessage {
            channel_id: row.get("channel_id")?,
            participant_id: row.get("participant_id")?,
            message_id: row.get("message_id")?,
            author: Author::parse(&author_raw).unwrap_or(Author::System),
            body: row.get("body")?,
            normalized_body: row.get("normalized_body")?,
            created_at_ms: row.get("created_at_ms")?,
        })
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn append(&self, record: StoredMessage) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO messages
                (channel_id, participant_id, message_id, author, body, normalized_body, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.channel_id,
                record.participant_id,
                record.message_id,
                record.author.as_str(),
                record.body,
                record.normalized_body,
                record.created_at_ms,
            ],
        )?;
        Ok(())
    }

    async fn recent(&self, key: &ConversationKey, limit: u32) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT channel_id, participant_id, message_id, author, body, normalized_body, created_at_ms
             FROM messages
             WHERE channel_id = ?1 AND participant_id = ?2
             ORDER BY created_at_ms DESC, id DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![key.channel_id, key.participant_id, limit],
            Self::row_to_message,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn find_by_message_id(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<Option<StoredMessage>> {
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                "SELECT channel_id, participant_id, message_id, author, body, normalized_body, created_at_ms
                 FROM messages
                 WHERE channel_id = ?1 AND message_id = ?2
                 ORDER BY id DESC
                 LIMIT 1",
                params![channel_id, message_id],
                Self::row_to_message,
            )
            .optional()?;
        Ok(found)
    }

    async fn automation_sent_since(
        &self,
        key: &ConversationKey,
        normalized_body: &str,
        since_ms: i64,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE channel_id = ?1 AND participant_id = ?2
               AND author = 'automation'
               AND normalized_body = ?3
               AND created_at_ms >= ?4",
            params![key.channel_id, key.participant_id, normalized_body, since_ms],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

#[async_trait]
impl LockStore for SqliteStore {
    async fn get_lock(&self, key: &ConversationKey) -> Result<Option<LockState>> {
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                "SELECT locked_until_ms, source FROM locks
                 WHERE channel_id = ?1 AND participant_id = ?2",
                params![key.channel_id, key.participant_id],
                |row| {
                    let locked_until_ms: Option<i64> = row.get(0)?;
                    let source_raw: String = row.get(1)?;
                    Ok(LockState {
                        locked_until_ms,
                        source: LockSource::parse(&source_raw).unwrap_or(LockSource::AdminReply),
                    })
                },
            )
            .optional()?;
        Ok(found)
    }

    async fn set_lock(&self, key: &ConversationKey, state: LockState) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO locks (channel_id, participant_id, locked_until_ms, source, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (channel_id, participant_id) DO UPDATE SET
                locked_until_ms = excluded.locked_until_ms,
                source = excluded.source,
                updated_at_ms = excluded.updated_at_ms",
            params![
                key.channel_id,
                key.participant_id,
                state.locked_until_ms,
                state.source.as_str(),
                crate::util::now_ms(),
            ],
        )?;
        Ok(())
    }

    async fn clear_lock(&self, key: &ConversationKey) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM locks WHERE channel_id = ?1 AND participant_id = ?2",
            params![key.channel_id, key.participant_id],
        )?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn get_session(&self, channel_id: &str) -> Result<Option<SessionRecord>> {
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                "SELECT status, allowance FROM sessions WHERE channel_id = ?1",
                params![channel_id],
                |row| {
                    let status_raw: String = row.get(0)?;
                    let allowance: Option<i64> = row.get(1)?;
                    Ok((status_raw, allowance))
                },
            )
            .optional()?;
        Ok(found.map(|(status_raw, allowance)| SessionRecord {
            channel_id: channel_id.to_string(),
            status: SessionStatus::parse(&status_raw).unwrap_or(SessionStatus::Expired),
            allowance,
        }))
    }

    async fn upsert_status(&self, channel_id: &str, status: SessionStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (channel_id, status, allowance, updated_at_ms)
             VALUES (?1, ?2, NULL, ?3)
             ON CONFLICT (channel_id) DO UPDATE SET
                status = excluded.status,
                updated_at_ms = excluded.updated_at_ms",
            params![channel_id, status.as_str(), crate::util::now_ms()],
        )?;
        Ok(())
    }

    async fn set_allowance(&self, channel_id: &str, allowance: Option<i64>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sessions SET allowance = ?2, updated_at_ms = ?3 WHERE channel_id = ?1",
            params![channel_id, allowance, crate::util::now_ms()],
        )?;
        Ok(())
    }

    async fn decrement_allowance(&self, channel_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sessions SET allowance = allowance - 1, updated_at_ms = ?2
             WHERE channel_id = ?1 AND allowance IS NOT NULL AND allowance > 0",
            params![channel_id, crate::util::now_ms()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ConversationKey {
        ConversationKey::new("ch1", "+111")
    }

    fn user_message(body: &str, at: i64) -> StoredMessage {
        StoredMessage {
            channel_id: "ch1".into(),
            participant_id: "+111".into(),
            message_id: Some(format!("mid-{at}")),
            author: Author::User,
            body: body.into(),
            normalized_body: crate::util::normalize_text(body),
            created_at_ms: at,
        }
    }

    #[tokio::test]
    async fn append_and_recent_newest_first() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.append(user_message("first", 1_000)).await.unwrap();
        store.append(user_message("second", 2_000)).await.unwrap();
        store.append(user_message("third", 3_000)).await.unwrap();

        let recent = store.recent(&key(), 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].body, "third");
        assert_eq!(recent[1].body, "second");
    }

    #[tokio::test]
    async fn recent_is_scoped_to_conversation() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.append(user_message("mine", 1_000)).await.unwrap();
        let mut other = user_message("theirs", 2_000);
        other.participant_id = "+222".into();
        store.append(other).await.unwrap();

        let recent = store.recent(&key(), 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].body, "mine");
    }

    #[tokio::test]
    async fn find_by_message_id_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.append(user_message("hello", 1_000)).await.unwrap();

        let found = store.find_by_message_id("ch1", "mid-1000").await.unwrap();
        assert_eq!(found.unwrap().body, "hello");
        assert!(store.find_by_message_id("ch1", "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn automation_probe_matches_only_automation_rows() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.append(user_message("thanks", 1_000)).await.unwrap();
        let mut bot = user_message("thanks", 2_000);
        bot.author = Author::Automation;
        store.append(bot).await.unwrap();

        assert!(store
            .automation_sent_since(&key(), "thanks", 1_500)
            .await
            .unwrap());
        // Window starts after the automation row.
        assert!(!store
            .automation_sent_since(&key(), "thanks", 2_500)
            .await
            .unwrap());
        assert!(!store
            .automation_sent_since(&key(), "different", 0)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn lock_round_trip_and_clear() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.get_lock(&key()).await.unwrap().is_none());

        let state = LockState {
            locked_until_ms: Some(99_000),
            source: LockSource::Emoji,
        };
        store.set_lock(&key(), state).await.unwrap();
        assert_eq!(store.get_lock(&key()).await.unwrap(), Some(state));

        // Upsert replaces.
        let longer = LockState {
            locked_until_ms: None,
            source: LockSource::Label,
        };
        store.set_lock(&key(), longer).await.unwrap();
        assert_eq!(store.get_lock(&key()).await.unwrap(), Some(longer));

        store.clear_lock(&key()).await.unwrap();
        assert!(store.get_lock(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lock_survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sb.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .set_lock(
                    &key(),
                    LockState {
                        locked_until_ms: Some(123_456),
                        source: LockSource::AdminReply,
                    },
                )
                .await
                .unwrap();
        }
        let reopened = SqliteStore::open(&path).unwrap();
        let lock = reopened.get_lock(&key()).await.unwrap().unwrap();
        assert_eq!(lock.locked_until_ms, Some(123_456));
        assert_eq!(lock.source, LockSource::AdminReply);
    }

    #[tokio::test]
    async fn session_status_and_allowance() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.get_session("ch1").await.unwrap().is_none());

        store.upsert_status("ch1", SessionStatus::Active).await.unwrap();
        let session = store.get_session("ch1").await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert!(session.allows_auto_reply());

        // Unmetered sessions are unaffected by decrement.
        store.decrement_allowance("ch1").await.unwrap();
        let session = store.get_session("ch1").await.unwrap().unwrap();
        assert_eq!(session.allowance, None);

        store.set_allowance("ch1", Some(2)).await.unwrap();
        store.decrement_allowance("ch1").await.unwrap();
        let session = store.get_session("ch1").await.unwrap().unwrap();
        assert_eq!(session.allowance, Some(1));
        // Never goes below zero.
        store.decrement_allowance("ch1").await.unwrap();
        store.decrement_allowance("ch1").await.unwrap();
        let session = store.get_session("ch1").await.unwrap().unwrap();
        assert_eq!(session.allowance, Some(0));

        store.upsert_status("ch1", SessionStatus::Suspended).await.unwrap();
        let session = store.get_session("ch1").await.unwrap().unwrap();
        assert!(!session.allows_auto_reply());
    }
}
