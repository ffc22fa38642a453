//! Event record and typed domain events.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::DomainError;
use crate::id::StreamId;

/// An immutable, sequenced fact belonging to one stream.
///
/// This is the persisted record shape. Changes must stay additive (new optional
/// payload fields) so historical events remain replayable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Owning aggregate.
    pub stream_id: StreamId,
    /// Aggregate category (e.g. `"Agreement"`).
    pub event_type: String,
    /// Fully-qualified, versioned name (e.g. `"agreement.created.v1"`).
    pub event_name: String,
    /// Position within the stream, starting at 1, gap-free.
    pub sequence: u64,
    /// Key-value payload; schema owned by `event_name`.
    pub payload: JsonValue,
}

impl Event {
    /// Identity of this occurrence, used for idempotent delivery.
    pub fn key(&self) -> EventKey {
        EventKey {
            stream_id: self.stream_id.clone(),
            sequence: self.sequence,
            event_name: self.event_name.clone(),
        }
    }
}

/// `(stream_id, sequence, event_name)`: uniquely identifies an event occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey {
    pub stream_id: StreamId,
    pub sequence: u64,
    pub event_name: String,
}

impl core::fmt::Display for EventKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}@{}#{}", self.event_name, self.stream_id, self.sequence)
    }
}

/// A typed event from one aggregate's catalog.
///
/// Implementations map each variant to a stable versioned name and back. The
/// store and the aggregate code must stay in lock-step on this catalog.
pub trait DomainEvent: Clone + core::fmt::Debug + Sized {
    /// Stable versioned name, e.g. `"agreement.created.v1"`.
    fn event_name(&self) -> &'static str;

    /// Serialize the variant's data into a JSON object payload.
    fn to_payload(&self) -> Result<JsonValue, DomainError>;

    /// Decode a stored record. Names outside the catalog are
    /// [`DomainError::UnknownEventType`].
    fn from_event(event: &Event) -> Result<Self, DomainError>;
}

/// Split `"agreement.created.v1"` into `("agreement.created", 1)`.
///
/// Returns `None` when the name has no `.v<N>` suffix, `N` is zero, or the base
/// name is empty.
pub fn parse_event_name(name: &str) -> Option<(&str, u32)> {
    let (base, version) = name.rsplit_once(".v")?;
    if base.is_empty() || base.ends_with('.') {
        return None;
    }
    let version: u32 = version.parse().ok()?;
    if version == 0 {
        return None;
    }
    Some((base, version))
}

/// Serialize `data` as an event payload; anything but a JSON object is rejected.
pub fn encode_payload<T: Serialize>(event_name: &str, data: &T) -> Result<JsonValue, DomainError> {
    let value = serde_json::to_value(data).map_err(|e| DomainError::payload(event_name, e.to_string()))?;
    if !value.is_object() {
        return Err(DomainError::payload(event_name, "payload must be a JSON object"));
    }
    Ok(value)
}

/// Deserialize the payload of a stored event into its typed form.
pub fn decode_payload<T: DeserializeOwned>(event: &Event) -> Result<T, DomainError> {
    serde_json::from_value(event.payload.clone())
        .map_err(|e| DomainError::payload(event.event_name.clone(), e.to_string()))
}
