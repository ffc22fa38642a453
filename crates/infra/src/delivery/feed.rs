use std::sync::Arc;

use tracing::{debug, instrument, warn};

use covenant_events::{EventBus, SubscriberFailure, SubscriberId};

use super::DeliveryError;
use super::cursor_store::CursorStore;
use crate::event_store::{Cursor, EventStore};

#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Events per `read_all` page.
    pub batch_size: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self { batch_size: 256 }
    }
}

impl FeedConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// What one [`EventFeed::pump`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PumpReport {
    /// Events the cursor moved past.
    pub events: usize,
    pub delivered: usize,
    pub skipped: usize,
    pub failures: Vec<SubscriberFailure>,
    /// Position after the pump.
    pub cursor: Cursor,
    /// The feed stopped at an event the subscriber has not finished.
    pub stalled: bool,
}

/// Redelivery path for one subscriber: follows the global log from that
/// subscriber's cursor and hands every event routed to it to the bus.
///
/// The cursor is keyed by the subscriber id and moves past an event only once
/// this subscriber has processed it. A failing subscriber holds its own feed
/// at that event, which is retried on the next pump; feeds of other
/// subscribers keep advancing.
pub struct EventFeed<S> {
    subscriber: SubscriberId,
    store: S,
    bus: Arc<EventBus>,
    cursors: Arc<dyn CursorStore>,
    config: FeedConfig,
}

impl<S> core::fmt::Debug for EventFeed<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventFeed")
            .field("subscriber", &self.subscriber)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: EventStore> EventFeed<S> {
    pub fn new(
        subscriber: impl Into<SubscriberId>,
        store: S,
        bus: Arc<EventBus>,
        cursors: Arc<dyn CursorStore>,
    ) -> Self {
        Self {
            subscriber: subscriber.into(),
            store,
            bus,
            cursors,
            config: FeedConfig::default(),
        }
    }

    /// One feed per subscriber registered on `bus`, all sharing `store` and
    /// `cursors`.
    pub fn per_subscriber(store: S, bus: Arc<EventBus>, cursors: Arc<dyn CursorStore>, config: FeedConfig) -> Vec<Self>
    where
        S: Clone,
    {
        bus.subscriber_ids()
            .into_iter()
            .map(|id| Self::new(id.clone(), store.clone(), bus.clone(), cursors.clone()).with_config(config.clone()))
            .collect()
    }

    pub fn with_config(mut self, config: FeedConfig) -> Self {
        self.config = config;
        self
    }

    pub fn subscriber(&self) -> &SubscriberId {
        &self.subscriber
    }

    /// Deliver everything recorded after the saved cursor, page by page.
    #[instrument(skip_all, fields(subscriber = %self.subscriber), err)]
    pub fn pump(&self) -> Result<PumpReport, DeliveryError> {
        let mut cursor = self.cursors.load(self.subscriber.as_str())?;
        let mut report = PumpReport {
            cursor,
            ..PumpReport::default()
        };

        loop {
            let page = self.store.read_all(cursor, self.config.batch_size.max(1))?;
            if page.is_empty() {
                break;
            }

            for recorded in &page.events {
                let delivery = self.bus.deliver_to(&self.subscriber, &recorded.event);
                report.delivered += delivery.delivered;
                report.skipped += delivery.skipped;

                if !delivery.is_settled() {
                    warn!(
                        position = recorded.position,
                        event = %recorded.event.key(),
                        failures = delivery.failures.len(),
                        in_flight = delivery.in_flight,
                        "delivery stalled; event will be retried"
                    );
                    report.failures.extend(delivery.failures);
                    report.stalled = true;
                    return self.finish(cursor, report);
                }

                cursor = recorded.cursor();
                report.events += 1;
            }
            self.cursors.save(self.subscriber.as_str(), cursor)?;
        }

        self.finish(cursor, report)
    }

    fn finish(&self, cursor: Cursor, mut report: PumpReport) -> Result<PumpReport, DeliveryError> {
        if cursor != report.cursor {
            self.cursors.save(self.subscriber.as_str(), cursor)?;
        }
        report.cursor = cursor;
        if report.events > 0 {
            debug!(subscriber = %self.subscriber, events = report.events, cursor = %cursor, "feed advanced");
        }
        Ok(report)
    }
}
