//! Postgres implementations of the ledger capability traits.

mod postgres;

pub use postgres::{migrate, PgAccountStore, PgCatalog, PgLedgerStore};
