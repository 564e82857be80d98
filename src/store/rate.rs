//! Minute-window rate counters.

use rusqlite::{OptionalExtension, params};

use super::{Store, now_secs};
use crate::error::StoreError;

impl Store {
    /// Increment the counter for `key` within the current minute window and
    /// return the new count. A window rollover resets the count to 1.
    pub fn incr_rate_counter(&self, key: &str) -> Result<u64, StoreError> {
        let window = now_secs() / 60;
        self.with_conn(|c| {
            let row = c
                .query_row(
                    "SELECT count, window_start FROM rate_counters WHERE key = ?1",
                    params![key],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()?;
            let count = match row {
                Some((count, start)) if start == window => count + 1,
                _ => 1,
            };
            c.execute(
                "INSERT OR REPLACE INTO rate_counters(key, count, window_start) \
                 VALUES (?1, ?2, ?3)",
                params![key, count, window],
            )?;
            Ok(count as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_increments_within_window() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.incr_rate_counter("http").unwrap(), 1);
        assert_eq!(store.incr_rate_counter("http").unwrap(), 2);
        assert_eq!(store.incr_rate_counter("other").unwrap(), 1);
    }

    #[test]
    fn counter_resets_on_window_rollover() {
        let store = Store::open_in_memory().unwrap();
        store.incr_rate_counter("http").unwrap();
        store.incr_rate_counter("http").unwrap();
        // Force the stored window into the past.
        store
            .with_conn(|c| {
                c.execute(
                    "UPDATE rate_counters SET window_start = window_start - 2 WHERE key = 'http'",
                    [],
                )
            })
            .unwrap();
        assert_eq!(store.incr_rate_counter("http").unwrap(), 1);
    }
}
