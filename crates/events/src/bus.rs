//! Explicit event bus with idempotent, isolated delivery.
//!
//! This module provides the **event bus pattern**: committed events are fanned
//! out to every subscriber registered for the event's name.
//!
//! ## Design
//!
//! - **Constructed, not global**: all registrations happen on an
//!   [`EventBusBuilder`] at startup; the built [`EventBus`] is immutable and can be
//!   shared across threads without locks.
//! - **At-least-once in, effectively-once out**: the bus may see the same event
//!   many times (synchronous publish after save, delivery workers replaying the
//!   store). Every `(event, subscriber)` pair is claimed in a
//!   [`ProcessedEvents`] store before the handler runs.
//! - **Failure isolation**: a failing (or panicking) subscriber does not stop
//!   delivery to the others, and its record is released so the event is
//!   retried on redelivery.
//!
//! ```text
//! save ─▶ EventStore.append ─▶ EventBus.publish ─┬─▶ search-index
//!                                                ├─▶ alerts
//!                                                └─▶ ...
//! ```

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use covenant_core::{Event, EventKey};

use crate::idempotency::{Claim, ProcessedEvents};
use crate::subscriber::{EventHandler, SubscriberId};

/// Bus configuration error (raised while building, never while delivering).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("subscriber `{subscriber_id}` is already registered for `{event_name}`")]
    DuplicateSubscription {
        event_name: String,
        subscriber_id: SubscriberId,
    },

    #[error("event name cannot be empty")]
    EmptyEventName,
}

/// A subscriber's handler failed for one event.
///
/// Isolated per subscriber, never rolled back into the originating save, and
/// retried on redelivery.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("subscriber `{subscriber_id}` failed on {event}: {reason}")]
pub struct SubscriberFailure {
    pub subscriber_id: SubscriberId,
    pub event: EventKey,
    pub reason: String,
}

/// What happened while delivering one or more events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Handler invocations that succeeded.
    pub delivered: usize,
    /// Pairs skipped because they were already processed.
    pub skipped: usize,
    /// Pairs skipped because another deliverer holds the claim right now.
    pub in_flight: usize,
    pub failures: Vec<SubscriberFailure>,
}

impl DeliveryReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Every subscriber is known to be done with the delivered events.
    pub fn is_settled(&self) -> bool {
        self.failures.is_empty() && self.in_flight == 0
    }

    fn merge(&mut self, other: DeliveryReport) {
        self.delivered += other.delivered;
        self.skipped += other.skipped;
        self.in_flight += other.in_flight;
        self.failures.extend(other.failures);
    }
}

enum Delivery {
    Ran,
    AlreadyProcessed,
    InFlight,
}

struct Subscription {
    subscriber_id: SubscriberId,
    handler: Arc<dyn EventHandler>,
}

/// Collects subscriber registrations before the bus is built.
pub struct EventBusBuilder {
    routes: HashMap<String, Vec<Subscription>>,
    processed: Arc<dyn ProcessedEvents>,
}

impl EventBusBuilder {
    /// Register `handler` as `subscriber_id` for events named `event_name`.
    ///
    /// The same subscriber id may listen to several event names (sharing one
    /// handler), but only once per name.
    pub fn subscribe(
        mut self,
        event_name: impl Into<String>,
        subscriber_id: impl Into<SubscriberId>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Self, BusError> {
        let event_name = event_name.into();
        let subscriber_id = subscriber_id.into();
        if event_name.trim().is_empty() {
            return Err(BusError::EmptyEventName);
        }

        let subs = self.routes.entry(event_name.clone()).or_default();
        if subs.iter().any(|s| s.subscriber_id == subscriber_id) {
            return Err(BusError::DuplicateSubscription {
                event_name,
                subscriber_id,
            });
        }
        subs.push(Subscription {
            subscriber_id,
            handler,
        });
        Ok(self)
    }

    /// Register one handler for every name in `event_names`.
    pub fn subscribe_all<'a>(
        mut self,
        event_names: impl IntoIterator<Item = &'a str>,
        subscriber_id: impl Into<SubscriberId>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Self, BusError> {
        let subscriber_id = subscriber_id.into();
        for name in event_names {
            self = self.subscribe(name, subscriber_id.clone(), handler.clone())?;
        }
        Ok(self)
    }

    pub fn build(self) -> EventBus {
        EventBus {
            routes: self.routes,
            processed: self.processed,
        }
    }
}

/// Immutable fan-out of committed events to registered subscribers.
pub struct EventBus {
    routes: HashMap<String, Vec<Subscription>>,
    processed: Arc<dyn ProcessedEvents>,
}

fn route_table(routes: &HashMap<String, Vec<Subscription>>) -> HashMap<&str, Vec<&str>> {
    routes
        .iter()
        .map(|(name, subs)| (name.as_str(), subs.iter().map(|s| s.subscriber_id.as_str()).collect()))
        .collect()
}

impl core::fmt::Debug for EventBusBuilder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventBusBuilder")
            .field("routes", &route_table(&self.routes))
            .finish_non_exhaustive()
    }
}

impl core::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventBus")
            .field("routes", &route_table(&self.routes))
            .finish_non_exhaustive()
    }
}

impl EventBus {
    pub fn builder(processed: Arc<dyn ProcessedEvents>) -> EventBusBuilder {
        EventBusBuilder {
            routes: HashMap::new(),
            processed,
        }
    }

    /// Subscriber ids registered for `event_name`, in registration order.
    pub fn subscribers_for(&self, event_name: &str) -> Vec<&SubscriberId> {
        self.routes
            .get(event_name)
            .map(|subs| subs.iter().map(|s| &s.subscriber_id).collect())
            .unwrap_or_default()
    }

    /// Every registered subscriber id, sorted and without duplicates.
    pub fn subscriber_ids(&self) -> Vec<&SubscriberId> {
        let mut ids: Vec<&SubscriberId> = self.routes.values().flatten().map(|s| &s.subscriber_id).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Deliver committed events, in order, to their subscribers.
    pub fn publish(&self, events: &[Event]) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for event in events {
            report.merge(self.deliver(event));
        }
        report
    }

    /// Deliver a single event to every subscriber of its name.
    pub fn deliver(&self, event: &Event) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let Some(subs) = self.routes.get(&event.event_name) else {
            return report;
        };

        let key = event.key();
        for sub in subs {
            self.run_one(sub, &key, event, &mut report);
        }
        report
    }

    /// Deliver a single event to `subscriber_id` only.
    ///
    /// An event the subscriber does not listen to yields an empty report.
    pub fn deliver_to(&self, subscriber_id: &SubscriberId, event: &Event) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let sub = self
            .routes
            .get(&event.event_name)
            .and_then(|subs| subs.iter().find(|s| &s.subscriber_id == subscriber_id));
        if let Some(sub) = sub {
            self.run_one(sub, &event.key(), event, &mut report);
        }
        report
    }

    fn run_one(&self, sub: &Subscription, key: &EventKey, event: &Event, report: &mut DeliveryReport) {
        match self.claim_and_run(sub, key, event) {
            Ok(Delivery::Ran) => report.delivered += 1,
            Ok(Delivery::AlreadyProcessed) => report.skipped += 1,
            Ok(Delivery::InFlight) => report.in_flight += 1,
            Err(reason) => {
                warn!(
                    subscriber = %sub.subscriber_id,
                    event = %key,
                    error = %reason,
                    "subscriber failed; event left unprocessed for redelivery"
                );
                report.failures.push(SubscriberFailure {
                    subscriber_id: sub.subscriber_id.clone(),
                    event: key.clone(),
                    reason,
                });
            }
        }
    }

    fn claim_and_run(&self, sub: &Subscription, key: &EventKey, event: &Event) -> Result<Delivery, String> {
        match self.processed.claim(key, &sub.subscriber_id).map_err(|e| e.to_string())? {
            Claim::Acquired => {}
            Claim::AlreadyProcessed => {
                debug!(subscriber = %sub.subscriber_id, event = %key, "already processed; skipping");
                return Ok(Delivery::AlreadyProcessed);
            }
            Claim::InFlight => {
                debug!(subscriber = %sub.subscriber_id, event = %key, "claimed by another deliverer; skipping");
                return Ok(Delivery::InFlight);
            }
        }

        let outcome = match catch_unwind(AssertUnwindSafe(|| sub.handler.handle(event))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(format!("{err:#}")),
            Err(panic) => Err(panic_message(panic.as_ref())),
        };

        match outcome {
            Ok(()) => {
                self.processed
                    .complete(key, &sub.subscriber_id)
                    .map_err(|e| format!("handler ran but completion was not recorded: {e}"))?;
                Ok(Delivery::Ran)
            }
            Err(reason) => {
                if let Err(e) = self.processed.release(key, &sub.subscriber_id) {
                    warn!(subscriber = %sub.subscriber_id, event = %key, error = %e, "failed to release claim");
                }
                Err(reason)
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use covenant_core::StreamId;
    use serde_json::json;

    use super::*;
    use crate::idempotency::InMemoryProcessedEvents;

    fn event(stream: &str, seq: u64, name: &str) -> Event {
        Event {
            stream_id: StreamId::new(stream).unwrap(),
            event_type: "Agreement".into(),
            event_name: name.into(),
            sequence: seq,
            payload: json!({ "n": seq }),
        }
    }

    fn counting(counter: Arc<AtomicUsize>) -> Arc<dyn EventHandler> {
        Arc::new(move |_: &Event| -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn redelivery_to_same_subscriber_is_a_noop() {
        let runs = Arc::new(AtomicUsize::new(0));
        let bus = EventBus::builder(Arc::new(InMemoryProcessedEvents::new()))
            .subscribe("agreement.updated.v1", "search-index", counting(runs.clone()))
            .unwrap()
            .build();

        let ev = event("A1", 3, "agreement.updated.v1");
        let first = bus.deliver(&ev);
        let second = bus.deliver(&ev);

        assert_eq!(first.delivered, 1);
        assert_eq!(second.delivered, 0);
        assert_eq!(second.skipped, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn other_subscribers_still_run() {
        let search = Arc::new(AtomicUsize::new(0));
        let alerts = Arc::new(AtomicUsize::new(0));
        let bus = EventBus::builder(Arc::new(InMemoryProcessedEvents::new()))
            .subscribe("agreement.updated.v1", "search-index", counting(search.clone()))
            .unwrap()
            .subscribe("agreement.updated.v1", "alerts", counting(alerts.clone()))
            .unwrap()
            .build();

        let ev = event("A1", 3, "agreement.updated.v1");
        bus.deliver(&ev);
        bus.deliver(&ev);

        assert_eq!(search.load(Ordering::SeqCst), 1);
        assert_eq!(alerts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_subscriber_is_isolated_and_retried() {
        let healthy = Arc::new(AtomicUsize::new(0));
        let attempts = Arc::new(AtomicUsize::new(0));
        let flaky_attempts = attempts.clone();
        let flaky: Arc<dyn EventHandler> = Arc::new(move |_: &Event| -> anyhow::Result<()> {
            if flaky_attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("mail server unavailable");
            }
            Ok(())
        });

        let processed = Arc::new(InMemoryProcessedEvents::new());
        let bus = EventBus::builder(processed.clone())
            .subscribe("agreement.created.v1", "notifications", flaky)
            .unwrap()
            .subscribe("agreement.created.v1", "search-index", counting(healthy.clone()))
            .unwrap()
            .build();

        let ev = event("A1", 1, "agreement.created.v1");
        let first = bus.deliver(&ev);
        assert_eq!(first.delivered, 1);
        assert_eq!(first.failures.len(), 1);
        assert_eq!(first.failures[0].subscriber_id.as_str(), "notifications");
        assert!(!processed.is_processed(&ev.key(), &"notifications".into()).unwrap());

        let second = bus.deliver(&ev);
        assert!(second.is_clean());
        assert_eq!(second.delivered, 1);
        assert_eq!(second.skipped, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(healthy.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_subscriber_is_contained() {
        let healthy = Arc::new(AtomicUsize::new(0));
        let boom: Arc<dyn EventHandler> = Arc::new(|_: &Event| -> anyhow::Result<()> { panic!("boom") });
        let bus = EventBus::builder(Arc::new(InMemoryProcessedEvents::new()))
            .subscribe("agreement.created.v1", "explodes", boom)
            .unwrap()
            .subscribe("agreement.created.v1", "search-index", counting(healthy.clone()))
            .unwrap()
            .build();

        let report = bus.deliver(&event("A1", 1, "agreement.created.v1"));
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].reason.contains("boom"));
        assert_eq!(healthy.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn in_flight_claims_are_not_settled() {
        let runs = Arc::new(AtomicUsize::new(0));
        let processed = Arc::new(InMemoryProcessedEvents::new());
        let bus = EventBus::builder(processed.clone())
            .subscribe("agreement.created.v1", "alerts", counting(runs.clone()))
            .unwrap()
            .build();

        let ev = event("A1", 1, "agreement.created.v1");
        // A concurrent deliverer holds the claim.
        processed.claim(&ev.key(), &"alerts".into()).unwrap();

        let report = bus.deliver(&ev);
        assert!(report.is_clean());
        assert!(!report.is_settled());
        assert_eq!(report.in_flight, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn routes_by_event_name() {
        let runs = Arc::new(AtomicUsize::new(0));
        let bus = EventBus::builder(Arc::new(InMemoryProcessedEvents::new()))
            .subscribe("agreement.deleted.v1", "search-index", counting(runs.clone()))
            .unwrap()
            .build();

        let report = bus.publish(&[event("A1", 1, "agreement.created.v1"), event("A1", 2, "agreement.deleted.v1")]);
        assert_eq!(report.delivered, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(bus.subscribers_for("agreement.created.v1").is_empty());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let runs = Arc::new(AtomicUsize::new(0));
        let err = EventBus::builder(Arc::new(InMemoryProcessedEvents::new()))
            .subscribe_all(["a.v1", "b.v1"], "search-index", counting(runs.clone()))
            .unwrap()
            .subscribe("b.v1", "search-index", counting(runs))
            .unwrap_err();
        assert!(matches!(err, BusError::DuplicateSubscription { .. }));
    }

    #[test]
    fn builder_debug_lists_routes() {
        let builder = EventBus::builder(Arc::new(InMemoryProcessedEvents::new()))
            .subscribe("agreement.created.v1", "search-index", counting(Arc::new(AtomicUsize::new(0))))
            .unwrap();
        let rendered = format!("{builder:?}");
        assert!(rendered.starts_with("EventBusBuilder"), "{rendered}");
        assert!(rendered.contains("search-index"), "{rendered}");
    }

    #[test]
    fn deliver_to_runs_only_the_named_subscriber() {
        let search = Arc::new(AtomicUsize::new(0));
        let alerts = Arc::new(AtomicUsize::new(0));
        let bus = EventBus::builder(Arc::new(InMemoryProcessedEvents::new()))
            .subscribe("agreement.created.v1", "search-index", counting(search.clone()))
            .unwrap()
            .subscribe_all(["agreement.created.v1", "agreement.deleted.v1"], "alerts", counting(alerts.clone()))
            .unwrap()
            .build();
        let ids: Vec<&str> = bus.subscriber_ids().into_iter().map(SubscriberId::as_str).collect();
        assert_eq!(ids, vec!["alerts", "search-index"]);

        let created = event("A1", 1, "agreement.created.v1");
        let report = bus.deliver_to(&"alerts".into(), &created);
        assert_eq!(report.delivered, 1);
        assert_eq!((search.load(Ordering::SeqCst), alerts.load(Ordering::SeqCst)), (0, 1));

        let again = bus.deliver_to(&"alerts".into(), &created);
        assert_eq!(again.skipped, 1);

        // Not routed to this subscriber: nothing to do.
        let deleted = event("A1", 2, "agreement.deleted.v1");
        assert_eq!(bus.deliver_to(&"search-index".into(), &deleted), DeliveryReport::default());

        // The full fan-out still owes search-index its run.
        let rest = bus.deliver(&created);
        assert_eq!((rest.delivered, rest.skipped), (1, 1));
    }

    #[test]
    fn distinct_occurrences_are_distinct() {
        let runs = Arc::new(AtomicUsize::new(0));
        let bus = EventBus::builder(Arc::new(InMemoryProcessedEvents::new()))
            .subscribe("agreement.updated.v1", "search-index", counting(runs.clone()))
            .unwrap()
            .build();

        bus.deliver(&event("A1", 2, "agreement.updated.v1"));
        bus.deliver(&event("A1", 3, "agreement.updated.v1"));
        bus.deliver(&event("A2", 2, "agreement.updated.v1"));
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
