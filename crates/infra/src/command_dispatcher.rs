//! Command execution pipeline (application-level orchestration).
//!
//! This module implements the **command dispatch pattern** for event-sourced
//! aggregates: every command name maps to exactly one handler, and the handler
//! owns one load → domain call → save cycle through an [`AggregateRepository`].
//!
//! ## Command Execution Flow
//!
//! ```text
//! Command
//!   ↓
//! 1. Look up the single handler registered for the command name
//!   ↓
//! 2. Handler: load aggregate (replay) at version N
//!   ↓
//! 3. Handler: domain method validates, then raises events
//!   ↓
//! 4. Handler: save with ExpectedVersion::Exact(N)
//!   ↓
//! 5. Conflict? re-run steps 2-4 from scratch (bounded), else return
//! ```
//!
//! The dispatcher is the only component that retries, and only for
//! concurrency conflicts. Every other failure propagates unchanged in kind.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use covenant_core::{Aggregate, DomainError, DomainResult, Event, ExpectedVersion, StreamId};
use covenant_events::Command;

use crate::event_store::{EventStore, EventStoreError};
use crate::repository::{AggregateRepository, RepositoryError};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no handler registered for command `{0}`")]
    UnknownCommand(String),

    /// Configuration error: one handler per command name.
    #[error("a handler is already registered for command `{0}`")]
    DuplicateHandler(String),

    /// Command rejected before any event was created.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Domain precondition violated (e.g. updating a deleted aggregate).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("aggregate `{0}` not found")]
    NotFound(StreamId),

    /// Optimistic concurrency failure; surfaced only after retries are exhausted.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    /// Stored history contains an event the aggregate cannot apply. Fatal.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// Other replay or encoding failure (sequence gap, malformed payload).
    #[error(transparent)]
    Domain(DomainError),

    #[error(transparent)]
    Store(EventStoreError),

    /// The caller's deadline passed. The append may or may not have committed.
    #[error("command timed out after {0:?}; effect unknown")]
    Timeout(Duration),

    /// The handler panicked or could not be run.
    #[error("command handler failed: {0}")]
    Handler(String),
}

impl DispatchError {
    /// Safe to resend: conflicts (fresh state may succeed) and timeouts (given
    /// idempotent subscribers).
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Concurrency(_) | DispatchError::Timeout(_))
    }

    fn is_conflict(&self) -> bool {
        matches!(self, DispatchError::Concurrency(_))
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => DispatchError::Validation(msg),
            DomainError::InvalidOperation(msg) => DispatchError::InvalidOperation(msg),
            e @ DomainError::UnknownEventType { .. } => DispatchError::UnknownEventType(e.to_string()),
            other => DispatchError::Domain(other),
        }
    }
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match value {
            e @ EventStoreError::ConcurrencyConflict { .. } => DispatchError::Concurrency(e.to_string()),
            other => DispatchError::Store(other),
        }
    }
}

impl From<RepositoryError> for DispatchError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::NotFound { id, .. } => DispatchError::NotFound(id),
            RepositoryError::Domain(e) => e.into(),
            RepositoryError::Store(e) => e.into(),
        }
    }
}

/// Successful result of a command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub aggregate_id: StreamId,
    /// Aggregate version after the save.
    pub version: u64,
    /// Events committed by this command (empty when nothing changed).
    pub events: Vec<Event>,
}

/// Handles one command name.
///
/// Implementations must perform their own load → domain call → save cycle and
/// keep no state between invocations: the dispatcher may call them again for
/// the same command after a conflict.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, command: &Command) -> Result<CommandOutcome, DispatchError>;
}

impl<F> CommandHandler for F
where
    F: Fn(&Command) -> Result<CommandOutcome, DispatchError> + Send + Sync,
{
    fn handle(&self, command: &Command) -> Result<CommandOutcome, DispatchError> {
        self(command)
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Total handler invocations per command when conflicts occur (>= 1).
    pub max_attempts: u32,
    /// Pause before attempt `n + 1` is `n * retry_backoff`.
    pub retry_backoff: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff: Duration::from_millis(5),
        }
    }
}

impl DispatcherConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

/// Routes commands to their registered handler with bounded conflict retry.
#[derive(Default)]
pub struct CommandDispatcher {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
    config: DispatcherConfig,
}

impl core::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("CommandDispatcher")
            .field("commands", &names)
            .field("config", &self.config)
            .finish()
    }
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: DispatcherConfig) -> Self {
        Self {
            handlers: HashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn register(
        &mut self,
        command_name: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), DispatchError> {
        let command_name = command_name.into();
        if self.handlers.contains_key(&command_name) {
            return Err(DispatchError::DuplicateHandler(command_name));
        }
        self.handlers.insert(command_name, handler);
        Ok(())
    }

    pub fn handles(&self, command_name: &str) -> bool {
        self.handlers.contains_key(command_name)
    }

    /// Run the handler for `command`, retrying the whole handler on conflict.
    #[instrument(
        skip_all,
        fields(command = %command.name(), aggregate_id = ?command.aggregate_id().map(StreamId::as_str)),
        err
    )]
    pub fn send(&self, command: &Command) -> Result<CommandOutcome, DispatchError> {
        let handler = self
            .handlers
            .get(command.name())
            .ok_or_else(|| DispatchError::UnknownCommand(command.name().to_string()))?;

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match invoke(handler.as_ref(), command) {
                Err(err) if err.is_conflict() && attempt < max_attempts => {
                    warn!(attempt, max_attempts, error = %err, "concurrency conflict; retrying with fresh state");
                    thread::sleep(self.config.retry_backoff * attempt);
                    attempt += 1;
                }
                Err(err) if err.is_conflict() => {
                    warn!(attempts = attempt, error = %err, "concurrency conflict; retries exhausted");
                    return Err(err);
                }
                Ok(outcome) => {
                    debug!(attempt, version = outcome.version, events = outcome.events.len(), "command applied");
                    return Ok(outcome);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// [`send`](Self::send) bounded by `timeout`.
    ///
    /// On expiry the in-flight attempt keeps running in the background and
    /// may still commit; the caller gets [`DispatchError::Timeout`].
    pub fn send_with_timeout(self: &Arc<Self>, command: Command, timeout: Duration) -> Result<CommandOutcome, DispatchError> {
        let (tx, rx) = mpsc::sync_channel(1);
        let dispatcher = Arc::clone(self);
        let name = command.name().to_string();

        thread::Builder::new()
            .name(format!("send:{name}"))
            .spawn(move || {
                // The receiver may be gone after a timeout.
                let _ = tx.send(dispatcher.send(&command));
            })
            .map_err(|e| DispatchError::Handler(format!("failed to spawn command thread: {e}")))?;

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(command = %name, ?timeout, "command timed out; effect unknown");
                Err(DispatchError::Timeout(timeout))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(DispatchError::Handler("command thread ended without a result".to_string()))
            }
        }
    }
}

fn invoke(handler: &dyn CommandHandler, command: &Command) -> Result<CommandOutcome, DispatchError> {
    match catch_unwind(AssertUnwindSafe(|| handler.handle(command))) {
        Ok(result) => result,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            Err(DispatchError::Handler(reason))
        }
    }
}

/// Canonical creation cycle: refuse existing ids, build through the
/// aggregate's factory, save expecting an empty stream.
pub fn create_aggregate<S, A>(
    repo: &AggregateRepository<S>,
    id: StreamId,
    build: impl FnOnce(StreamId) -> DomainResult<A>,
) -> Result<CommandOutcome, DispatchError>
where
    S: EventStore,
    A: Aggregate,
{
    if repo.exists(&id)? {
        return Err(DispatchError::Validation(format!("{} `{id}` already exists", A::AGGREGATE_TYPE)));
    }
    let mut aggregate = build(id.clone())?;
    let events = repo.save(&mut aggregate, ExpectedVersion::Exact(0))?;
    Ok(CommandOutcome {
        aggregate_id: id,
        version: aggregate.version(),
        events,
    })
}

/// Canonical update cycle: load fresh, capture the version, mutate, save
/// expecting that version.
pub fn update_aggregate<S, A>(
    repo: &AggregateRepository<S>,
    id: &StreamId,
    mutate: impl FnOnce(&mut A) -> DomainResult<()>,
) -> Result<CommandOutcome, DispatchError>
where
    S: EventStore,
    A: Aggregate,
{
    let mut aggregate: A = repo.load(id)?;
    let expected = ExpectedVersion::Exact(aggregate.version());
    mutate(&mut aggregate)?;
    let events = repo.save(&mut aggregate, expected)?;
    Ok(CommandOutcome {
        aggregate_id: id.clone(),
        version: aggregate.version(),
        events,
    })
}
