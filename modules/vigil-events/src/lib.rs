//! Append-only notification outbox backed by Postgres.
//!
//! Stores opaque JSONB payloads keyed by event type, the acting voter and the
//! subject cluster. Delivery transports (push, email) drain undelivered rows
//! and mark them delivered; this crate knows nothing about either.

pub mod store;
pub mod types;

pub use store::EventStore;
pub use types::{AppendEvent, StoredEvent};
