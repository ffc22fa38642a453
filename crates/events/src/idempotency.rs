//! Idempotency records: which subscriber has already processed which event.
//!
//! A record is keyed by `(event_name, stream_id, sequence, subscriber_id)`. The
//! bus claims a record before running a handler and completes it afterwards, so
//! at-least-once delivery turns into effectively-once side effects:
//!
//! ```text
//! claim ──Acquired──▶ handler ──Ok──▶ complete   (record is now "done")
//!   │                    └────Err──▶ release    (retried on redelivery)
//!   ├──AlreadyProcessed──▶ skip
//!   └──InFlight─────────▶ skip (a concurrent deliverer owns it)
//! ```
//!
//! A crash between the handler's side effect and `complete` leaves the claim in
//! flight; durable stores expire such claims after a lease so the event is
//! redelivered.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use covenant_core::EventKey;

use crate::subscriber::SubscriberId;

/// Outcome of trying to claim `(event, subscriber)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The caller owns the record and must `complete` or `release` it.
    Acquired,
    /// The handler already ran to completion for this event.
    AlreadyProcessed,
    /// Another deliverer currently holds the claim.
    InFlight,
}

#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("idempotency store lock poisoned")]
    Poisoned,

    #[error("no claim held for subscriber `{subscriber}` on {event}")]
    NotClaimed { event: EventKey, subscriber: SubscriberId },

    #[error("idempotency backend failure: {0}")]
    Backend(String),
}

/// Queryable store of processed-event records.
///
/// Implementations must make `claim` atomic: two concurrent callers for the
/// same key can never both observe [`Claim::Acquired`].
pub trait ProcessedEvents: Send + Sync {
    fn claim(&self, event: &EventKey, subscriber: &SubscriberId) -> Result<Claim, IdempotencyError>;

    /// Mark the claimed record as processed.
    fn complete(&self, event: &EventKey, subscriber: &SubscriberId) -> Result<(), IdempotencyError>;

    /// Give up a claim without marking it processed.
    fn release(&self, event: &EventKey, subscriber: &SubscriberId) -> Result<(), IdempotencyError>;

    fn is_processed(&self, event: &EventKey, subscriber: &SubscriberId) -> Result<bool, IdempotencyError>;
}

impl<P> ProcessedEvents for Arc<P>
where
    P: ProcessedEvents + ?Sized,
{
    fn claim(&self, event: &EventKey, subscriber: &SubscriberId) -> Result<Claim, IdempotencyError> {
        (**self).claim(event, subscriber)
    }

    fn complete(&self, event: &EventKey, subscriber: &SubscriberId) -> Result<(), IdempotencyError> {
        (**self).complete(event, subscriber)
    }

    fn release(&self, event: &EventKey, subscriber: &SubscriberId) -> Result<(), IdempotencyError> {
        (**self).release(event, subscriber)
    }

    fn is_processed(&self, event: &EventKey, subscriber: &SubscriberId) -> Result<bool, IdempotencyError> {
        (**self).is_processed(event, subscriber)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RecordState {
    InFlight,
    Done,
}

type RecordKey = (EventKey, SubscriberId);

/// In-memory idempotency records for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryProcessedEvents {
    records: Mutex<HashMap<RecordKey, RecordState>>,
}

impl InMemoryProcessedEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed records.
    pub fn processed_count(&self) -> usize {
        self.records
            .lock()
            .map(|records| records.values().filter(|s| **s == RecordState::Done).count())
            .unwrap_or(0)
    }
}

impl ProcessedEvents for InMemoryProcessedEvents {
    fn claim(&self, event: &EventKey, subscriber: &SubscriberId) -> Result<Claim, IdempotencyError> {
        let mut records = self.records.lock().map_err(|_| IdempotencyError::Poisoned)?;
        let key = (event.clone(), subscriber.clone());
        match records.get(&key) {
            Some(RecordState::Done) => Ok(Claim::AlreadyProcessed),
            Some(RecordState::InFlight) => Ok(Claim::InFlight),
            None => {
                records.insert(key, RecordState::InFlight);
                Ok(Claim::Acquired)
            }
        }
    }

    fn complete(&self, event: &EventKey, subscriber: &SubscriberId) -> Result<(), IdempotencyError> {
        let mut records = self.records.lock().map_err(|_| IdempotencyError::Poisoned)?;
        match records.get_mut(&(event.clone(), subscriber.clone())) {
            Some(state) => {
                *state = RecordState::Done;
                Ok(())
            }
            None => Err(IdempotencyError::NotClaimed {
                event: event.clone(),
                subscriber: subscriber.clone(),
            }),
        }
    }

    fn release(&self, event: &EventKey, subscriber: &SubscriberId) -> Result<(), IdempotencyError> {
        let mut records = self.records.lock().map_err(|_| IdempotencyError::Poisoned)?;
        let key = (event.clone(), subscriber.clone());
        // Completed records are never rolled back.
        if records.get(&key) == Some(&RecordState::InFlight) {
            records.remove(&key);
        }
        Ok(())
    }

    fn is_processed(&self, event: &EventKey, subscriber: &SubscriberId) -> Result<bool, IdempotencyError> {
        let records = self.records.lock().map_err(|_| IdempotencyError::Poisoned)?;
        Ok(records.get(&(event.clone(), subscriber.clone())) == Some(&RecordState::Done))
    }
}

#[cfg(test)]
mod tests {
    use covenant_core::StreamId;

    use super::*;

    fn key(seq: u64) -> EventKey {
        EventKey {
            stream_id: StreamId::new("A1").unwrap(),
            sequence: seq,
            event_name: "agreement.created.v1".into(),
        }
    }

    #[test]
    fn claim_complete_cycle() {
        let store = InMemoryProcessedEvents::new();
        let sub = SubscriberId::new("search-index");

        assert_eq!(store.claim(&key(1), &sub).unwrap(), Claim::Acquired);
        assert_eq!(store.claim(&key(1), &sub).unwrap(), Claim::InFlight);
        store.complete(&key(1), &sub).unwrap();
        assert_eq!(store.claim(&key(1), &sub).unwrap(), Claim::AlreadyProcessed);
        assert!(store.is_processed(&key(1), &sub).unwrap());
        assert_eq!(store.processed_count(), 1);
    }

    #[test]
    fn release_allows_a_retry() {
        let store = InMemoryProcessedEvents::new();
        let sub = SubscriberId::new("alerts");

        assert_eq!(store.claim(&key(2), &sub).unwrap(), Claim::Acquired);
        store.release(&key(2), &sub).unwrap();
        assert!(!store.is_processed(&key(2), &sub).unwrap());
        assert_eq!(store.claim(&key(2), &sub).unwrap(), Claim::Acquired);
    }

    #[test]
    fn release_never_undoes_completion() {
        let store = InMemoryProcessedEvents::new();
        let sub = SubscriberId::new("alerts");
        store.claim(&key(3), &sub).unwrap();
        store.complete(&key(3), &sub).unwrap();
        store.release(&key(3), &sub).unwrap();
        assert!(store.is_processed(&key(3), &sub).unwrap());
    }

    #[test]
    fn records_are_per_subscriber() {
        let store = InMemoryProcessedEvents::new();
        let a = SubscriberId::new("search-index");
        let b = SubscriberId::new("alerts");
        store.claim(&key(3), &a).unwrap();
        store.complete(&key(3), &a).unwrap();
        assert_eq!(store.claim(&key(3), &b).unwrap(), Claim::Acquired);
    }

    #[test]
    fn complete_without_claim_is_an_error() {
        let store = InMemoryProcessedEvents::new();
        let err = store.complete(&key(9), &SubscriberId::new("x")).unwrap_err();
        assert!(matches!(err, IdempotencyError::NotClaimed { .. }));
    }
}
