use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use covenant_core::{Event, ExpectedVersion, StreamId, parse_event_name};

/// An event ready to be appended to a stream (not yet assigned a sequence number).
///
/// The store assigns `sequence` during append; the stream and category are
/// given once per `append` call, so a batch can never span two streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_name: String,
    pub payload: JsonValue,
}

impl UncommittedEvent {
    pub fn new(event_name: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            event_name: event_name.into(),
            payload,
        }
    }
}

impl From<&Event> for UncommittedEvent {
    fn from(event: &Event) -> Self {
        Self::new(event.event_name.clone(), event.payload.clone())
    }
}

/// Store-wide insertion position.
///
/// `Cursor::START` sits before the first event; `read_all(cursor, ..)` returns
/// events strictly after `cursor`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub u64);

impl Cursor {
    pub const START: Cursor = Cursor(0);

    pub fn position(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for Cursor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// A committed event plus its store-wide position (starting at 1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub position: u64,
    pub event: Event,
}

impl RecordedEvent {
    pub fn cursor(&self) -> Cursor {
        Cursor(self.position)
    }
}

/// One page of the global log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventPage {
    pub events: Vec<RecordedEvent>,
    /// Cursor to pass to the next `read_all` call. Equals the request cursor
    /// when the page is empty.
    pub next_cursor: Cursor,
}

impl EventPage {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Event store operation error.
///
/// These are **infrastructure errors** (storage, concurrency) as opposed to
/// domain errors (validation, invariants).
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// Another writer advanced the stream first.
    #[error("concurrency conflict on stream `{stream_id}`: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        stream_id: StreamId,
        expected: ExpectedVersion,
        actual: u64,
    },

    #[error("aggregate type mismatch on stream `{stream_id}`: stream is `{existing}`, attempted `{attempted}`")]
    AggregateTypeMismatch {
        stream_id: StreamId,
        existing: String,
        attempted: String,
    },

    /// The batch was rejected before touching storage.
    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("event store lock poisoned")]
    Poisoned,

    #[error("event store backend failure: {0}")]
    Backend(String),
}

impl EventStoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, EventStoreError::ConcurrencyConflict { .. })
    }
}

/// Append-only event store.
///
/// ## Design Principles
///
/// - **No storage assumptions**: works with the in-memory implementation
///   (tests/dev) and the Postgres backend (feature `postgres`).
/// - **Optimistic locking**: via `ExpectedVersion`; `append` is the sole
///   serialization point between concurrent writers.
/// - **Append-only**: events are never modified or deleted.
///
/// ## Append Semantics
///
/// `append()`:
/// - Validates the whole batch first (event names, payload shape)
/// - Checks the expected version against the current stream version
/// - Enforces a stable `event_type` per stream
/// - Assigns sequence numbers `current + 1 ..= current + len`
/// - Persists the batch atomically: all events become visible or none do
/// - An empty batch writes nothing but is still checked against the expected
///   version
///
/// ## Read Semantics
///
/// - `read()` returns one stream ascending by sequence; empty if the stream
///   does not exist.
/// - `read_all()` pages through every stream in store-wide insertion order.
pub trait EventStore: Send + Sync {
    fn append(
        &self,
        stream_id: &StreamId,
        event_type: &str,
        expected_version: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<Event>, EventStoreError>;

    fn read(&self, stream_id: &StreamId) -> Result<Vec<Event>, EventStoreError>;

    /// Up to `limit` events recorded after `after`, in insertion order.
    fn read_all(&self, after: Cursor, limit: usize) -> Result<EventPage, EventStoreError>;

    /// Current version of a stream (0 if it does not exist).
    fn stream_version(&self, stream_id: &StreamId) -> Result<u64, EventStoreError> {
        Ok(self.read(stream_id)?.last().map(|e| e.sequence).unwrap_or(0))
    }
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(
        &self,
        stream_id: &StreamId,
        event_type: &str,
        expected_version: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<Event>, EventStoreError> {
        (**self).append(stream_id, event_type, expected_version, events)
    }

    fn read(&self, stream_id: &StreamId) -> Result<Vec<Event>, EventStoreError> {
        (**self).read(stream_id)
    }

    fn read_all(&self, after: Cursor, limit: usize) -> Result<EventPage, EventStoreError> {
        (**self).read_all(after, limit)
    }

    fn stream_version(&self, stream_id: &StreamId) -> Result<u64, EventStoreError> {
        (**self).stream_version(stream_id)
    }
}

/// Reject a batch before any storage is touched.
pub(crate) fn validate_batch(event_type: &str, events: &[UncommittedEvent]) -> Result<(), EventStoreError> {
    if event_type.trim().is_empty() {
        return Err(EventStoreError::InvalidAppend("event_type cannot be empty".to_string()));
    }
    for (idx, e) in events.iter().enumerate() {
        if parse_event_name(&e.event_name).is_none() {
            return Err(EventStoreError::InvalidAppend(format!(
                "event name `{}` at index {idx} is not of the form <name>.v<N>",
                e.event_name
            )));
        }
        if !e.payload.is_object() {
            return Err(EventStoreError::InvalidAppend(format!(
                "payload of `{}` at index {idx} must be a JSON object",
                e.event_name
            )));
        }
    }
    Ok(())
}
