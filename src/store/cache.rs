//! Content-addressed result cache with lazy TTL expiry.

use rusqlite::{OptionalExtension, params};

use super::{Store, now_secs};
use crate::error::StoreError;

impl Store {
    /// Fetch a cached value, deleting and missing entries whose age exceeds
    /// their TTL.
    pub fn cache_get(&self, tool: &str, args_hash: &str) -> Result<Option<String>, StoreError> {
        let row = self.with_conn(|c| {
            c.query_row(
                "SELECT value, ttl_s, created_at FROM tool_cache \
                 WHERE tool = ?1 AND args_hash = ?2",
                params![tool, args_hash],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()
        })?;
        let Some((value, ttl_s, created_at)) = row else {
            return Ok(None);
        };
        if ttl_s > 0 && now_secs() - created_at > ttl_s {
            self.with_conn(|c| {
                c.execute(
                    "DELETE FROM tool_cache WHERE tool = ?1 AND args_hash = ?2",
                    params![tool, args_hash],
                )
            })?;
            return Ok(None);
        }
        Ok(value)
    }

    /// Insert or replace a cache entry. Callers skip this entirely when a
    /// step's `ttl_s` is 0.
    pub fn cache_put(
        &self,
        tool: &str,
        args_hash: &str,
        value: &str,
        ttl_s: u64,
    ) -> Result<(), StoreError> {
        let key = format!("{tool}:{args_hash}");
        self.with_conn(|c| {
            c.execute(
                "INSERT OR REPLACE INTO tool_cache\
                 (cache_key, tool, args_hash, value, version, ttl_s, created_at) \
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6)",
                params![key, tool, args_hash, value, ttl_s as i64, now_secs()],
            )
        })?;
        Ok(())
    }
}
