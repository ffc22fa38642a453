//! Agreement read models.
//!
//! Each read model is an [`EventHandler`] registered under its own subscriber
//! id. They tolerate at-least-once delivery: an event at or below the last
//! sequence applied for its stream is ignored. An event that skips ahead of
//! that sequence is refused, so the bus releases it and the feed redelivers
//! the stream in order.

pub mod agreement_alerts;
pub mod agreement_search;

use std::collections::HashMap;
use std::sync::Arc;

use covenant_agreements::AgreementEvent;
use covenant_core::{Event, StreamId};
use covenant_events::{BusError, EventBusBuilder, EventHandler};

pub use agreement_alerts::{AgreementAlerts, AlertSchedule, DueAlert};
pub use covenant_agreements::AlertKind;
pub use agreement_search::{AgreementSearchEntry, AgreementSearchIndex};

pub const SEARCH_INDEX: &str = AgreementSearchIndex::SUBSCRIBER_ID;
pub const ALERTS: &str = AgreementAlerts::SUBSCRIBER_ID;

/// Subscribe both read models to every agreement event.
pub fn register_read_models(
    builder: EventBusBuilder,
    search: Arc<AgreementSearchIndex>,
    alerts: Arc<AgreementAlerts>,
) -> Result<EventBusBuilder, BusError> {
    let search: Arc<dyn EventHandler> = search;
    let alerts: Arc<dyn EventHandler> = alerts;
    builder
        .subscribe_all(AgreementEvent::NAMES, SEARCH_INDEX, search)?
        .subscribe_all(AgreementEvent::NAMES, ALERTS, alerts)
}

/// `Ok(true)` when `event` is the next sequence of its stream, `Ok(false)`
/// when it was already applied, and an error when earlier events are missing.
fn next_in_stream(applied: &HashMap<StreamId, u64>, event: &Event) -> anyhow::Result<bool> {
    let last = applied.get(&event.stream_id).copied().unwrap_or(0);
    if event.sequence <= last {
        return Ok(false);
    }
    if event.sequence > last + 1 {
        anyhow::bail!(
            "{} out of order: expected sequence {}, got {}",
            event.key(),
            last + 1,
            event.sequence
        );
    }
    Ok(true)
}
