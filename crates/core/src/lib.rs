//! `covenant-core`: event-sourcing building blocks.
//!
//! This crate contains **pure domain** primitives (no storage or IO concerns):
//! stream identifiers, the persisted event record, the aggregate contract and
//! the domain error model.

pub mod aggregate;
pub mod error;
pub mod event;
pub mod id;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use event::{DomainEvent, Event, EventKey, decode_payload, encode_payload, parse_event_name};
pub use id::StreamId;
