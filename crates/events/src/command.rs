use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use covenant_core::{DomainError, StreamId};

/// A named request to change state (command abstraction).
///
/// Commands represent **intent**. They are transient: never persisted, used to
/// invoke exactly one handler once (plus bounded retries on conflict).
///
/// ## Command vs Event
///
/// - **Command**: "Update agreement A1's name" (may be rejected)
/// - **Event**: `agreement.attrs_updated.v1` at sequence 2 (a fact)
///
/// ## Aggregate Targeting
///
/// `aggregate_id` names the target stream. Creation commands may leave it empty,
/// in which case the handler assigns the identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    name: String,
    aggregate_id: Option<StreamId>,
    payload: JsonValue,
}

impl Command {
    pub fn new(name: impl Into<String>, aggregate_id: Option<StreamId>, payload: JsonValue) -> Self {
        Self {
            name: name.into(),
            aggregate_id,
            payload,
        }
    }

    /// Command without a target (creation).
    pub fn create(name: impl Into<String>, payload: JsonValue) -> Self {
        Self::new(name, None, payload)
    }

    /// Command addressed to an existing aggregate.
    pub fn to(name: impl Into<String>, aggregate_id: StreamId, payload: JsonValue) -> Self {
        Self::new(name, Some(aggregate_id), payload)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn aggregate_id(&self) -> Option<&StreamId> {
        self.aggregate_id.as_ref()
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    /// Target id, or a validation error for commands that require one.
    pub fn require_aggregate_id(&self) -> Result<&StreamId, DomainError> {
        self.aggregate_id
            .as_ref()
            .ok_or_else(|| DomainError::validation(format!("command `{}` requires a target aggregate id", self.name)))
    }

    /// Deserialize the payload into the handler's typed form.
    ///
    /// A payload that does not fit is a [`DomainError::Validation`]; it never
    /// reaches the aggregate.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, DomainError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| DomainError::validation(format!("command `{}` payload: {e}", self.name)))
    }
}
