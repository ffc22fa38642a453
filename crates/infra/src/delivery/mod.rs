//! At-least-once redelivery from the event store to the bus.
//!
//! The synchronous publish after save is best-effort. This module is the
//! durable path: one [`EventFeed`] per subscriber follows `read_all` from that
//! subscriber's saved cursor and a [`DeliveryWorker`] runs it in the background.

pub mod cursor_store;
pub mod feed;
pub mod worker;

use thiserror::Error;

use crate::event_store::EventStoreError;

pub use cursor_store::{CursorStore, CursorStoreError, InMemoryCursorStore};
#[cfg(feature = "postgres")]
pub use cursor_store::PostgresCursorStore;
pub use feed::{EventFeed, FeedConfig, PumpReport};
pub use worker::{DeliveryWorker, WorkerHandle};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error(transparent)]
    Cursor(#[from] CursorStoreError),

    #[error("failed to spawn delivery worker: {0}")]
    Spawn(#[source] std::io::Error),
}
