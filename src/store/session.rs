//! Per-thread session scratchpad and message passing.

use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use uuid::Uuid;

use super::{Store, now_secs};
use crate::error::StoreError;

/// One row of `session_messages`.
#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    pub id: String,
    pub sender: String,
    pub recipient: String,
    pub content: String,
    pub created_at: i64,
}

impl Store {
    /// Upsert a `(thread_id, key)` value. A missing thread id is a no-op:
    /// scratchpad state only makes sense inside a thread.
    pub fn kv_put(&self, thread_id: Option<&str>, key: &str, value: &str) -> Result<(), StoreError> {
        let Some(thread_id) = thread_id else {
            return Ok(());
        };
        let id = format!("{thread_id}:{key}");
        self.with_conn(|c| {
            c.execute(
                "INSERT OR REPLACE INTO session_kv(id, thread_id, key, value, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, thread_id, key, value, now_secs()],
            )
        })?;
        Ok(())
    }

    pub fn kv_get(&self, thread_id: Option<&str>, key: &str) -> Result<Option<String>, StoreError> {
        let Some(thread_id) = thread_id else {
            return Ok(None);
        };
        self.with_conn(|c| {
            c.query_row(
                "SELECT value FROM session_kv WHERE thread_id = ?1 AND key = ?2",
                params![thread_id, key],
                |row| row.get(0),
            )
            .optional()
        })
        .map_err(Into::into)
    }

    /// Most recently written keys for a thread, newest first.
    pub fn kv_recent(
        &self,
        thread_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, String, i64)>, StoreError> {
        let Some(thread_id) = thread_id else {
            return Ok(Vec::new());
        };
        self.with_conn(|c| {
            let mut stmt = c.prepare(
                "SELECT key, value, created_at FROM session_kv \
                 WHERE thread_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![thread_id, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            rows.collect()
        })
        .map_err(Into::into)
    }

    pub fn save_message(
        &self,
        thread_id: &str,
        sender: &str,
        recipient: &str,
        content: &str,
    ) -> Result<(), StoreError> {
        let id = Uuid::new_v4().simple().to_string();
        self.with_conn(|c| {
            c.execute(
                "INSERT INTO session_messages(id, thread_id, sender, recipient, content, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, thread_id, sender, recipient, content, now_secs()],
            )
        })?;
        Ok(())
    }

    /// Messages addressed to `recipient` within a thread, oldest first.
    pub fn fetch_messages(
        &self,
        thread_id: &str,
        recipient: &str,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        self.with_conn(|c| {
            let mut stmt = c.prepare(
                "SELECT id, sender, recipient, content, created_at FROM session_messages \
                 WHERE thread_id = ?1 AND recipient = ?2 ORDER BY created_at, rowid",
            )?;
            let rows = stmt.query_map(params![thread_id, recipient], |row| {
                Ok(MessageRecord {
                    id: row.get(0)?,
                    sender: row.get(1)?,
                    recipient: row.get(2)?,
                    content: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?;
            rows.collect()
        })
        .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_overwrites_on_put() {
        let store = Store::open_in_memory().unwrap();
        store.kv_put(Some("th"), "step:web_fetch", "a").unwrap();
        store.kv_put(Some("th"), "step:web_fetch", "b").unwrap();
        assert_eq!(
            store.kv_get(Some("th"), "step:web_fetch").unwrap().as_deref(),
            Some("b")
        );
    }

    #[test]
    fn kv_without_thread_is_noop() {
        let store = Store::open_in_memory().unwrap();
        store.kv_put(None, "k", "v").unwrap();
        assert_eq!(store.kv_get(None, "k").unwrap(), None);
        assert!(store.kv_recent(None, 10).unwrap().is_empty());
    }

    #[test]
    fn kv_recent_is_scoped_to_thread() {
        let store = Store::open_in_memory().unwrap();
        store.kv_put(Some("a"), "k1", "1").unwrap();
        store.kv_put(Some("a"), "k2", "2").unwrap();
        store.kv_put(Some("b"), "k3", "3").unwrap();
        let recent = store.kv_recent(Some("a"), 10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].0, "k2");
    }

    #[test]
    fn messages_filter_by_recipient() {
        let store = Store::open_in_memory().unwrap();
        store.save_message("th", "planner", "worker", "go").unwrap();
        store.save_message("th", "worker", "planner", "done").unwrap();
        let inbox = store.fetch_messages("th", "worker").unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].content, "go");
    }
}
