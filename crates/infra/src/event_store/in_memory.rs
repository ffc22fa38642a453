use std::collections::HashMap;
use std::sync::RwLock;

use covenant_core::{Event, ExpectedVersion, StreamId};

use super::r#trait::{Cursor, EventPage, EventStore, EventStoreError, RecordedEvent, UncommittedEvent, validate_batch};

#[derive(Debug, Default)]
struct Log {
    /// Every event in insertion order; position = index + 1.
    events: Vec<Event>,
    /// Positions of each stream's events, ascending by sequence.
    streams: HashMap<StreamId, Vec<usize>>,
}

impl Log {
    fn current_version(&self, stream_id: &StreamId) -> u64 {
        self.streams
            .get(stream_id)
            .and_then(|idx| idx.last())
            .map(|&i| self.events[i].sequence)
            .unwrap_or(0)
    }

    fn stream_type(&self, stream_id: &StreamId) -> Option<&str> {
        let first = *self.streams.get(stream_id)?.first()?;
        Some(self.events[first].event_type.as_str())
    }
}

/// In-memory append-only event store.
///
/// Intended for tests/dev. A single `RwLock` guards the log, so `append` is
/// the serialization point and readers never observe half a batch.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    log: RwLock<Log>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored events across all streams.
    pub fn len(&self) -> usize {
        self.log.read().map(|log| log.events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        stream_id: &StreamId,
        event_type: &str,
        expected_version: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<Event>, EventStoreError> {
        validate_batch(event_type, &events)?;

        let mut log = self.log.write().map_err(|_| EventStoreError::Poisoned)?;

        let current = log.current_version(stream_id);
        if !expected_version.matches(current) {
            return Err(EventStoreError::ConcurrencyConflict {
                stream_id: stream_id.clone(),
                expected: expected_version,
                actual: current,
            });
        }
        if events.is_empty() {
            return Ok(vec![]);
        }

        // Enforce aggregate type stability across the stream.
        if let Some(existing) = log.stream_type(stream_id) {
            if existing != event_type {
                return Err(EventStoreError::AggregateTypeMismatch {
                    stream_id: stream_id.clone(),
                    existing: existing.to_string(),
                    attempted: event_type.to_string(),
                });
            }
        }

        // Nothing below can fail, so the batch lands whole.
        let mut committed = Vec::with_capacity(events.len());
        for (offset, e) in events.into_iter().enumerate() {
            committed.push(Event {
                stream_id: stream_id.clone(),
                event_type: event_type.to_string(),
                event_name: e.event_name,
                sequence: current + offset as u64 + 1,
                payload: e.payload,
            });
        }

        let start = log.events.len();
        log.events.extend(committed.iter().cloned());
        log.streams
            .entry(stream_id.clone())
            .or_default()
            .extend(start..start + committed.len());

        Ok(committed)
    }

    fn read(&self, stream_id: &StreamId) -> Result<Vec<Event>, EventStoreError> {
        let log = self.log.read().map_err(|_| EventStoreError::Poisoned)?;
        Ok(log
            .streams
            .get(stream_id)
            .map(|idx| idx.iter().map(|&i| log.events[i].clone()).collect())
            .unwrap_or_default())
    }

    fn read_all(&self, after: Cursor, limit: usize) -> Result<EventPage, EventStoreError> {
        let log = self.log.read().map_err(|_| EventStoreError::Poisoned)?;
        let start = usize::try_from(after.position()).unwrap_or(usize::MAX).min(log.events.len());

        let events: Vec<RecordedEvent> = log.events[start..]
            .iter()
            .take(limit)
            .enumerate()
            .map(|(offset, e)| RecordedEvent {
                position: (start + offset + 1) as u64,
                event: e.clone(),
            })
            .collect();

        let next_cursor = events.last().map(RecordedEvent::cursor).unwrap_or(after);
        Ok(EventPage { events, next_cursor })
    }

    fn stream_version(&self, stream_id: &StreamId) -> Result<u64, EventStoreError> {
        let log = self.log.read().map_err(|_| EventStoreError::Poisoned)?;
        Ok(log.current_version(stream_id))
    }
}
