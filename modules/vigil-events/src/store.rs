//! EventStore: append-only notification outbox backed by Postgres.
//!
//! Reads in sequence order are gap-free: rows from in-flight transactions
//! are never skipped over by a drain.

use anyhow::Result;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::types::{AppendEvent, StoredEvent};

const COLUMNS: &str =
    "seq, ts, event_type, actor, subject_id, payload, schema_v, delivered_at";

// ---------------------------------------------------------------------------
// EventStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct EventStore {
    pool: PgPool,
}

impl EventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append an event. Returns its sequence number.
    pub async fn append(&self, event: AppendEvent) -> Result<i64> {
        let row = sqlx::query_as::<_, (i64,)>(
            r#"
            INSERT INTO events (event_type, actor, subject_id, payload, schema_v)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING seq
            "#,
        )
        .bind(&event.event_type)
        .bind(&event.actor)
        .bind(event.subject_id)
        .bind(&event.payload)
        .bind(event.schema_v)
        .fetch_one(&self.pool)
        .await?;

        let seq = row.0;

        // Best-effort PG NOTIFY to wake delivery workers.
        notify_new_event(&self.pool, seq).await;

        Ok(seq)
    }

    /// Read events in flat sequence order starting from `seq_start` (inclusive).
    ///
    /// **Gap-free guarantee:** if concurrent transactions created a momentary gap,
    /// this returns events only up to the gap boundary. The next call picks up
    /// where it left off once the gap closes.
    pub async fn read_from(&self, seq_start: i64, limit: usize) -> Result<Vec<StoredEvent>> {
        let rows = sqlx::query_as::<_, StoredEvent>(&format!(
            "SELECT {COLUMNS} FROM events WHERE seq >= $1 ORDER BY seq ASC LIMIT $2"
        ))
        .bind(seq_start)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(take_contiguous(rows, seq_start))
    }

    /// Read a single event by sequence number.
    pub async fn read_event(&self, seq: i64) -> Result<Option<StoredEvent>> {
        let row = sqlx::query_as::<_, StoredEvent>(&format!(
            "SELECT {COLUMNS} FROM events WHERE seq = $1"
        ))
        .bind(seq)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Read events filtered by event type, in sequence order.
    pub async fn read_by_type(
        &self,
        event_type: &str,
        seq_start: i64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>> {
        let rows = sqlx::query_as::<_, StoredEvent>(&format!(
            "SELECT {COLUMNS} FROM events \
             WHERE event_type = $1 AND seq >= $2 ORDER BY seq ASC LIMIT $3"
        ))
        .bind(event_type)
        .bind(seq_start)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// All events about one subject (e.g. a cluster), in sequence order.
    pub async fn read_by_subject(&self, subject_id: Uuid) -> Result<Vec<StoredEvent>> {
        let rows = sqlx::query_as::<_, StoredEvent>(&format!(
            "SELECT {COLUMNS} FROM events WHERE subject_id = $1 ORDER BY seq ASC"
        ))
        .bind(subject_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Oldest undelivered events, for a delivery transport to drain.
    pub async fn read_undelivered(&self, limit: usize) -> Result<Vec<StoredEvent>> {
        let rows = sqlx::query_as::<_, StoredEvent>(&format!(
            "SELECT {COLUMNS} FROM events \
             WHERE delivered_at IS NULL ORDER BY seq ASC LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Mark an event delivered. Returns false if it was already marked.
    pub async fn mark_delivered(&self, seq: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE events SET delivered_at = now() WHERE seq = $1 AND delivered_at IS NULL",
        )
        .bind(seq)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// The latest committed sequence number, or 0 if the table is empty.
    pub async fn latest_seq(&self) -> Result<i64> {
        let row = sqlx::query_as::<_, (Option<i64>,)>("SELECT MAX(seq) FROM events")
            .fetch_one(&self.pool)
            .await?;

        Ok(row.0.unwrap_or(0))
    }
}

/// Keep the prefix of `rows` whose seq values run contiguously from `seq_start`.
fn take_contiguous(rows: Vec<StoredEvent>, seq_start: i64) -> Vec<StoredEvent> {
    let mut result = Vec::with_capacity(rows.len());
    let mut expected_seq = seq_start;

    for row in rows {
        if row.seq != expected_seq {
            // In-flight transaction hasn't committed yet.
            break;
        }
        expected_seq = row.seq + 1;
        result.push(row);
    }

    result
}

// ---------------------------------------------------------------------------
// PG NOTIFY
// ---------------------------------------------------------------------------

async fn notify_new_event(pool: &PgPool, seq: i64) {
    let result = sqlx::query("SELECT pg_notify('events', $1::text)")
        .bind(seq)
        .execute(pool)
        .await;

    if let Err(e) = result {
        warn!(error = %e, seq, "PG NOTIFY failed (non-fatal)");
    }
}

// ---------------------------------------------------------------------------
// sqlx::FromRow for StoredEvent
// ---------------------------------------------------------------------------

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredEvent {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> std::result::Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(StoredEvent {
            seq: row.try_get("seq")?,
            ts: row.try_get("ts")?,
            event_type: row.try_get("event_type")?,
            actor: row.try_get("actor")?,
            subject_id: row.try_get("subject_id")?,
            payload: row.try_get("payload")?,
            schema_v: row.try_get("schema_v")?,
            delivered_at: row.try_get("delivered_at")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Test utilities
// ---------------------------------------------------------------------------

#[cfg(feature = "test-utils")]
impl EventStore {
    /// Read all events (for tests). No gap-free enforcement.
    pub async fn read_all(&self) -> Result<Vec<StoredEvent>> {
        let rows = sqlx::query_as::<_, StoredEvent>(&format!(
            "SELECT {COLUMNS} FROM events ORDER BY seq ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
