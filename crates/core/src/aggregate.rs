//! Aggregate contract for event-sourced domain models.

use crate::error::{DomainError, DomainResult};
use crate::event::{DomainEvent, Event};
use crate::id::StreamId;

/// Optimistic concurrency expectation for an aggregate stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking (migrations, administrative appends).
    Any,
    /// Require the stream to be at an exact version. `Exact(0)` means "no stream yet".
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }
}

impl core::fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ExpectedVersion::Any => f.write_str("any"),
            ExpectedVersion::Exact(v) => write!(f, "{v}"),
        }
    }
}

/// Identity and bookkeeping every aggregate carries.
///
/// Holds no storage handle: an aggregate is identified by id only, and all IO
/// happens in a repository.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRoot {
    id: StreamId,
    version: u64,
    uncommitted: Vec<Event>,
}

impl AggregateRoot {
    pub fn new(id: StreamId) -> Self {
        Self {
            id,
            version: 0,
            uncommitted: Vec::new(),
        }
    }

    pub fn id(&self) -> &StreamId {
        &self.id
    }

    /// Highest sequence applied from the store.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn uncommitted_events(&self) -> &[Event] {
        &self.uncommitted
    }

    /// Sequence the next raised event will receive.
    pub fn next_sequence(&self) -> u64 {
        self.version + self.uncommitted.len() as u64 + 1
    }
}

/// Event-sourced aggregate.
///
/// - **State mutation** happens only in `apply`, a pure function over the typed
///   event catalog. No other path may set state fields.
/// - **Domain methods** validate first and fail fast without raising anything,
///   then call [`Aggregate::raise`].
/// - State after replaying `[1..N]` is a deterministic function of that sequence.
pub trait Aggregate: Sized {
    type Event: DomainEvent;

    /// Category recorded as `event_type` on every event (e.g. `"Agreement"`).
    const AGGREGATE_TYPE: &'static str;

    /// Fresh, not-yet-created instance, ready for replay.
    fn empty(id: StreamId) -> Self;

    fn root(&self) -> &AggregateRoot;

    fn root_mut(&mut self) -> &mut AggregateRoot;

    /// Evolve in-memory state from a single event.
    fn apply(&mut self, event: &Self::Event);

    fn id(&self) -> &StreamId {
        self.root().id()
    }

    fn version(&self) -> u64 {
        self.root().version()
    }

    fn uncommitted_events(&self) -> &[Event] {
        self.root().uncommitted_events()
    }

    /// Record a new event: build the record, apply it, queue it for persistence.
    fn raise(&mut self, event: Self::Event) -> DomainResult<()> {
        let record = Event {
            stream_id: self.id().clone(),
            event_type: Self::AGGREGATE_TYPE.to_string(),
            event_name: event.event_name().to_string(),
            sequence: self.root().next_sequence(),
            payload: event.to_payload()?,
        };
        self.apply(&event);
        self.root_mut().uncommitted.push(record);
        Ok(())
    }

    /// Apply one stored event during rehydration.
    fn replay(&mut self, record: &Event) -> DomainResult<()> {
        if record.stream_id != *self.id() || record.event_type != Self::AGGREGATE_TYPE {
            return Err(DomainError::unknown_event_type(
                Self::AGGREGATE_TYPE,
                format!("{} ({} stream {})", record.event_name, record.event_type, record.stream_id),
            ));
        }
        let expected = self.version() + 1;
        if record.sequence != expected {
            return Err(DomainError::OutOfOrder {
                expected,
                found: record.sequence,
            });
        }

        let typed = Self::Event::from_event(record)?;
        self.apply(&typed);
        self.root_mut().version = record.sequence;
        Ok(())
    }

    /// Build an aggregate by folding its stored history in order.
    fn rehydrate<'a>(id: StreamId, history: impl IntoIterator<Item = &'a Event>) -> DomainResult<Self> {
        let mut aggregate = Self::empty(id);
        for record in history {
            aggregate.replay(record)?;
        }
        Ok(aggregate)
    }

    /// Drop the uncommitted queue after a successful append at `version`.
    fn mark_committed(&mut self, version: u64) -> Vec<Event> {
        let root = self.root_mut();
        root.version = version;
        std::mem::take(&mut root.uncommitted)
    }
}
