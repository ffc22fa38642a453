//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// invalid transitions, catalog mismatches). Storage concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Command input violated an aggregate invariant. Raised before any event exists.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The aggregate is not in a state that allows the requested operation.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// An identifier was invalid (e.g. empty stream id).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A stored event is not part of the aggregate's event catalog.
    ///
    /// Signals a deployment/schema mismatch; never skipped.
    #[error("unknown event type `{event_name}` for aggregate `{aggregate_type}`")]
    UnknownEventType {
        aggregate_type: String,
        event_name: String,
    },

    /// A payload could not be encoded or decoded for a known event.
    #[error("payload of `{event_name}` is malformed: {reason}")]
    Payload { event_name: String, reason: String },

    /// Replay received an event that does not continue the stream.
    #[error("out-of-order replay (expected sequence {expected}, found {found})")]
    OutOfOrder { expected: u64, found: u64 },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn unknown_event_type(aggregate_type: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self::UnknownEventType {
            aggregate_type: aggregate_type.into(),
            event_name: event_name.into(),
        }
    }

    pub fn payload(event_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Payload {
            event_name: event_name.into(),
            reason: reason.into(),
        }
    }
}
