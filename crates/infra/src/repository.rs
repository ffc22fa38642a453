//! Aggregate repository: the only place aggregates meet storage.
//!
//! ```text
//! load:  EventStore.read(id) ─▶ Aggregate::rehydrate ─▶ aggregate @ version N
//! save:  aggregate.uncommitted ─▶ EventStore.append(expected = N) ─▶ mark_committed
//!                                                             └─▶ EventBus.publish
//! ```
//!
//! The load → mutate → save cycle is the unit of optimistic concurrency. The
//! repository never retries a conflict; it hands it back unchanged so the
//! dispatcher can re-run the whole cycle against fresh state.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use covenant_core::{Aggregate, DomainError, Event, ExpectedVersion, StreamId};
use covenant_events::EventBus;

use crate::event_store::{EventStore, EventStoreError, UncommittedEvent};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("aggregate `{aggregate_type}` with id `{id}` not found")]
    NotFound { aggregate_type: &'static str, id: StreamId },

    /// Stored history could not be replayed (unknown event, gap, bad payload).
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] EventStoreError),
}

impl RepositoryError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, RepositoryError::Store(e) if e.is_conflict())
    }
}

/// Loads aggregates by replaying their streams and saves their uncommitted
/// events under an expected-version check.
pub struct AggregateRepository<S> {
    store: S,
    bus: Option<Arc<EventBus>>,
}

impl<S> core::fmt::Debug for AggregateRepository<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AggregateRepository")
            .field("publishes", &self.bus.is_some())
            .finish_non_exhaustive()
    }
}

impl<S> AggregateRepository<S> {
    pub fn new(store: S) -> Self {
        Self { store, bus: None }
    }

    /// Publish committed events to `bus` after every successful save.
    pub fn with_bus(store: S, bus: Arc<EventBus>) -> Self {
        Self { store, bus: Some(bus) }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: EventStore> AggregateRepository<S> {
    /// Replay the stream for `id`; an empty stream is `NotFound`.
    #[instrument(skip_all, fields(aggregate_type = A::AGGREGATE_TYPE, id = %id), err)]
    pub fn load<A: Aggregate>(&self, id: &StreamId) -> Result<A, RepositoryError> {
        self.try_load(id)?.ok_or_else(|| RepositoryError::NotFound {
            aggregate_type: A::AGGREGATE_TYPE,
            id: id.clone(),
        })
    }

    pub fn try_load<A: Aggregate>(&self, id: &StreamId) -> Result<Option<A>, RepositoryError> {
        let history = self.store.read(id)?;
        if history.is_empty() {
            return Ok(None);
        }
        let aggregate = A::rehydrate(id.clone(), &history)?;
        debug!(id = %id, version = aggregate.version(), "aggregate rehydrated");
        Ok(Some(aggregate))
    }

    pub fn exists(&self, id: &StreamId) -> Result<bool, RepositoryError> {
        Ok(self.store.stream_version(id)? > 0)
    }

    /// Append the aggregate's uncommitted events expecting `expected_version`.
    ///
    /// On success the aggregate's queue is cleared and its version advanced,
    /// then the committed events are published (when a bus is attached). On a
    /// conflict the aggregate is left untouched and must be discarded.
    #[instrument(
        skip_all,
        fields(aggregate_type = A::AGGREGATE_TYPE, id = %aggregate.id(), expected = %expected_version),
        err
    )]
    pub fn save<A: Aggregate>(
        &self,
        aggregate: &mut A,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<Event>, RepositoryError> {
        let pending: Vec<UncommittedEvent> = aggregate.uncommitted_events().iter().map(UncommittedEvent::from).collect();
        if pending.is_empty() {
            return Ok(vec![]);
        }

        let committed = self
            .store
            .append(aggregate.id(), A::AGGREGATE_TYPE, expected_version, pending)?;
        let version = committed.last().map(|e| e.sequence).unwrap_or(aggregate.version());
        aggregate.mark_committed(version);

        if let Some(bus) = &self.bus {
            let report = bus.publish(&committed);
            if !report.is_clean() {
                // The save stands; failed subscribers catch up via redelivery.
                warn!(
                    id = %aggregate.id(),
                    failures = report.failures.len(),
                    "some subscribers failed after save"
                );
            }
        }

        Ok(committed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{NaiveDate, TimeZone, Utc};

    use covenant_agreements::{Agreement, AgreementAttrs, AgreementKind, Term};
    use covenant_events::{EventHandler, InMemoryProcessedEvents};

    use super::*;
    use crate::event_store::InMemoryEventStore;

    fn attrs(name: &str) -> AgreementAttrs {
        AgreementAttrs {
            name: name.to_string(),
            counterparty: "Acme Corp".to_string(),
            description: None,
            kind: AgreementKind::Licensing,
            execution_date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            term: Term::months(12),
            auto_renew: true,
            outcome_notice: None,
            expiration_alert_enabled: false,
            outcome_notice_alert_enabled: false,
        }
    }

    fn a1() -> StreamId {
        StreamId::new("A1").unwrap()
    }

    fn created(repo: &AggregateRepository<InMemoryEventStore>) {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
        let mut agreement = Agreement::create(a1(), "u1", attrs("MSA"), now).unwrap();
        repo.save(&mut agreement, ExpectedVersion::Exact(0)).unwrap();
    }

    #[test]
    fn create_then_load() {
        let repo = AggregateRepository::new(InMemoryEventStore::new());
        created(&repo);

        let loaded: Agreement = repo.load(&a1()).unwrap();
        assert_eq!(loaded.version(), 1);
        assert_eq!(loaded.name(), Some("MSA"));
        assert!(loaded.uncommitted_events().is_empty());
        assert!(repo.exists(&a1()).unwrap());
    }

    #[test]
    fn missing_stream_is_not_found() {
        let repo = AggregateRepository::new(InMemoryEventStore::new());
        let err = repo.load::<Agreement>(&a1()).unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound { .. }));
        assert!(repo.try_load::<Agreement>(&a1()).unwrap().is_none());
    }

    #[test]
    fn second_writer_from_same_version_conflicts() {
        let repo = AggregateRepository::new(InMemoryEventStore::new());
        created(&repo);

        let mut first: Agreement = repo.load(&a1()).unwrap();
        let mut second: Agreement = repo.load(&a1()).unwrap();

        first.update_attrs(attrs("First")).unwrap();
        second.update_attrs(attrs("Second")).unwrap();

        let committed = repo.save(&mut first, ExpectedVersion::Exact(1)).unwrap();
        assert_eq!(committed[0].sequence, 2);
        assert_eq!(first.version(), 2);

        let err = repo.save(&mut second, ExpectedVersion::Exact(1)).unwrap_err();
        assert!(err.is_conflict());

        // Retry after reload succeeds.
        let mut fresh: Agreement = repo.load(&a1()).unwrap();
        fresh.update_attrs(attrs("Second")).unwrap();
        let version = fresh.version();
        repo.save(&mut fresh, ExpectedVersion::Exact(version)).unwrap();
        assert_eq!(repo.load::<Agreement>(&a1()).unwrap().name(), Some("Second"));
    }

    #[test]
    fn publishes_after_save_and_tolerates_failing_subscribers() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let counting: Arc<dyn EventHandler> = Arc::new(move |_: &Event| -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let failing: Arc<dyn EventHandler> =
            Arc::new(|_: &Event| -> anyhow::Result<()> { anyhow::bail!("index offline") });

        let bus = EventBus::builder(Arc::new(InMemoryProcessedEvents::new()))
            .subscribe("agreement.created.v1", "search-index", failing)
            .unwrap()
            .subscribe("agreement.created.v1", "alerts", counting)
            .unwrap()
            .build();
        let repo = AggregateRepository::with_bus(InMemoryEventStore::new(), Arc::new(bus));

        created(&repo);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(repo.store().stream_version(&a1()).unwrap(), 1);
    }
}
