//! Append-only event store boundary.
//!
//! This module defines the storage abstraction for event streams plus the
//! in-memory backend (tests/dev) and, with the `postgres` feature, the durable
//! Postgres backend.

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresEventStore;
pub use r#trait::{Cursor, EventPage, EventStore, EventStoreError, RecordedEvent, UncommittedEvent};
