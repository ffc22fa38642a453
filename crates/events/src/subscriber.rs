//! Subscriber identity and handler contract.

use serde::{Deserialize, Serialize};

use covenant_core::Event;

/// Stable identity of a subscriber (e.g. `"search-index"`).
///
/// Idempotency records are keyed by this id, so it must not change across
/// deployments for the same logical consumer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(String);

impl SubscriberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriberId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SubscriberId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Reacts to a committed event (read-model update, side effect).
///
/// The handler sees `stream_id`, `sequence` and `payload` through the event
/// record. Returning an error leaves the event unprocessed for this subscriber,
/// so it is retried on redelivery.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

impl<F> EventHandler for F
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, event: &Event) -> anyhow::Result<()> {
        self(event)
    }
}
