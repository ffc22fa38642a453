//! `covenant-events`: commands, subscribers and idempotent event delivery.
//!
//! Mechanics only: nothing here knows about storage backends or about any
//! particular aggregate.

pub mod bus;
pub mod command;
pub mod idempotency;
pub mod subscriber;

pub use bus::{BusError, DeliveryReport, EventBus, EventBusBuilder, SubscriberFailure};
pub use command::Command;
pub use idempotency::{Claim, IdempotencyError, InMemoryProcessedEvents, ProcessedEvents};
pub use subscriber::{EventHandler, SubscriberId};
