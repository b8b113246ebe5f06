//! PostgreSQL storage backend for the refline brokerage core.
//!
//! The in-memory backend in `refline-core` is the reference semantics; this
//! crate reproduces them on PostgreSQL with row-version guards in SQL. All
//! traversal logic stays in the core, so the schema here is flat rows only.

#![deny(unsafe_code)]

pub mod postgres;

pub use postgres::{BrokerStorageConfig, PgBrokerStore};
