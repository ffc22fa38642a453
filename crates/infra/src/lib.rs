//! Infrastructure layer: event storage, repositories, command dispatch,
//! event delivery and the agreement read models.

pub mod command_dispatcher;
pub mod command_handlers;
pub mod config;
pub mod delivery;
pub mod event_store;
pub mod projections;
pub mod repository;

#[cfg(feature = "postgres")]
pub mod db;

#[cfg(feature = "postgres")]
pub mod idempotency;


pub use command_dispatcher::{
    CommandDispatcher, CommandHandler, CommandOutcome, DispatchError, DispatcherConfig, create_aggregate,
    update_aggregate,
};
pub use command_handlers::register_agreement_handlers;
pub use config::{ConfigError, RuntimeConfig};
pub use repository::{AggregateRepository, RepositoryError};
