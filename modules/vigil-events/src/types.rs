//! Row types for the outbox. Domain-agnostic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An event as stored in Postgres. Returned by all read methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub seq: i64,
    pub ts: DateTime<Utc>,
    pub event_type: String,
    pub actor: Option<String>,
    pub subject_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub schema_v: i16,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// An event to be appended. The caller builds this; the store assigns seq/ts.
#[derive(Debug, Clone)]
pub struct AppendEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub actor: Option<String>,
    pub subject_id: Option<Uuid>,
    pub schema_v: i16,
}

impl AppendEvent {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            actor: None,
            subject_id: None,
            schema_v: 1,
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_subject(mut self, subject_id: Uuid) -> Self {
        self.subject_id = Some(subject_id);
        self
    }

    pub fn with_schema_v(mut self, v: i16) -> Self {
        self.schema_v = v;
        self
    }
}
