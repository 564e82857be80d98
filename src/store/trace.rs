//! Append-only trace and event log.

use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::Store;
use crate::error::StoreError;

/// One row of `traces`.
#[derive(Debug, Clone, Serialize)]
pub struct TraceSummary {
    pub id: String,
    pub thread_id: Option<String>,
    pub created_at: i64,
    pub event_count: u64,
}

/// One row of `trace_events`, payload decoded.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub id: String,
    pub trace_id: String,
    pub phase: String,
    pub role: String,
    pub payload: Value,
    pub created_at: i64,
}

/// A trace plus its events in insertion order.
#[derive(Debug, Clone, Serialize)]
pub struct TraceDetail {
    pub id: String,
    pub thread_id: Option<String>,
    pub created_at: i64,
    pub events: Vec<EventRecord>,
}

impl Store {
    /// Open a new trace and return its id.
    pub fn start_trace(&self, thread_id: Option<&str>) -> Result<String, StoreError> {
        let id = Uuid::new_v4().simple().to_string();
        self.with_conn(|c| {
            c.execute(
                "INSERT INTO traces(id, thread_id) VALUES (?1, ?2)",
                params![id, thread_id],
            )
        })?;
        Ok(id)
    }

    /// Append one event to a trace and return the event id.
    pub fn log_event(
        &self,
        trace_id: &str,
        phase: &str,
        role: &str,
        payload: &Value,
    ) -> Result<String, StoreError> {
        let id = Uuid::new_v4().simple().to_string();
        let blob = serde_json::to_string(payload)?;
        self.with_conn(|c| {
            c.execute(
                "INSERT INTO trace_events(id, trace_id, phase, role, payload) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, trace_id, phase, role, blob],
            )
        })?;
        Ok(id)
    }

    /// Most recent traces, newest first.
    pub fn list_recent_traces(&self, limit: usize) -> Result<Vec<TraceSummary>, StoreError> {
        self.with_conn(|c| {
            let mut stmt = c.prepare(
                "SELECT t.id, t.thread_id, t.created_at, \
                        (SELECT COUNT(*) FROM trace_events e WHERE e.trace_id = t.id) \
                 FROM traces t ORDER BY t.created_at DESC, t.rowid DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok(TraceSummary {
                    id: row.get(0)?,
                    thread_id: row.get(1)?,
                    created_at: row.get(2)?,
                    event_count: row.get::<_, i64>(3)? as u64,
                })
            })?;
            rows.collect()
        })
        .map_err(Into::into)
    }

    /// A trace with all of its events, or `None` if the id is unknown.
    pub fn trace_summary(&self, trace_id: &str) -> Result<Option<TraceDetail>, StoreError> {
        let head = self.with_conn(|c| {
            c.query_row(
                "SELECT id, thread_id, created_at FROM traces WHERE id = ?1",
                params![trace_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()
        })?;
        let Some((id, thread_id, created_at)) = head else {
            return Ok(None);
        };
        let events = self.events_for_trace(trace_id)?;
        Ok(Some(TraceDetail {
            id,
            thread_id,
            created_at,
            events,
        }))
    }

    /// All events of one trace in insertion order.
    pub fn events_for_trace(&self, trace_id: &str) -> Result<Vec<EventRecord>, StoreError> {
        self.with_conn(|c| {
            let mut stmt = c.prepare(
                "SELECT id, trace_id, phase, role, payload, created_at \
                 FROM trace_events WHERE trace_id = ?1 ORDER BY rowid",
            )?;
            let rows = stmt.query_map(params![trace_id], row_to_event)?;
            rows.collect()
        })
        .map_err(Into::into)
    }

    /// The most recent events across all traces, newest first. Feeds the
    /// insights aggregator.
    pub fn recent_events(&self, limit: usize) -> Result<Vec<EventRecord>, StoreError> {
        self.with_conn(|c| {
            let mut stmt = c.prepare(
                "SELECT id, trace_id, phase, role, payload, created_at \
                 FROM trace_events ORDER BY rowid DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], row_to_event)?;
            rows.collect()
        })
        .map_err(Into::into)
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<EventRecord, rusqlite::Error> {
    let payload: String = row.get(4)?;
    Ok(EventRecord {
        id: row.get(0)?,
        trace_id: row.get(1)?,
        phase: row.get(2)?,
        role: row.get(3)?,
        payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
        created_at: row.get(5)?,
    })
}
