//! Postgres-backed event store implementation.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | EventStoreError | Scenario |
//! |------------|----------------------|-----------------|----------|
//! | Database (unique violation) | `23505` | `ConcurrencyConflict` | Another writer inserted the same `(stream_id, sequence)` |
//! | Database (check violation) | `23514` | `InvalidAppend` | Invalid data (e.g. `sequence <= 0`) |
//! | Database (other) | Any other | `Backend` | Other database errors |
//! | Other | N/A | `Backend` | Network errors, pool closed, etc. |
//!
//! ## Ordering
//!
//! Every append takes a transaction-scoped advisory lock before inserting, so
//! `position` values become visible in commit order and `read_all` followers
//! never skip an event that commits late.

use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row, Transaction};
use tracing::{Span, instrument};

use covenant_core::{Event, ExpectedVersion, StreamId};

use super::r#trait::{Cursor, EventPage, EventStore, EventStoreError, RecordedEvent, UncommittedEvent, validate_batch};
use crate::db::{PgBackend, is_unique_violation};

/// Advisory lock key serializing appends (`'covenant'` as ASCII).
const APPEND_LOCK_KEY: i64 = 0x636f_7665_6e61_6e74;

/// Postgres-backed append-only event store.
///
/// `append()` runs in one transaction:
/// 1. Take the append advisory lock
/// 2. Read the current stream version and category
/// 3. Validate them against `expected_version` / `event_type`
/// 4. Insert the batch
///
/// The `UNIQUE (stream_id, sequence)` constraint is the final word: if two
/// writers ever pass step 3 together, one insert fails with a concurrency
/// conflict.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    db: PgBackend,
}

impl PostgresEventStore {
    pub fn new(db: PgBackend) -> Self {
        Self { db }
    }

    #[instrument(
        skip_all,
        fields(stream_id = %stream_id, event_count = events.len(), expected_version = %expected_version),
        err
    )]
    async fn append_events(
        &self,
        stream_id: &StreamId,
        event_type: &str,
        expected_version: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<Event>, EventStoreError> {
        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(APPEND_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("advisory_lock", e))?;

        let (current, existing_type) = check_stream_version(&mut tx, stream_id).await?;

        if let Some(existing) = existing_type {
            if existing != event_type {
                tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(EventStoreError::AggregateTypeMismatch {
                    stream_id: stream_id.clone(),
                    existing,
                    attempted: event_type.to_string(),
                });
            }
        }

        if !expected_version.matches(current) {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(EventStoreError::ConcurrencyConflict {
                stream_id: stream_id.clone(),
                expected: expected_version,
                actual: current,
            });
        }

        let mut committed = Vec::with_capacity(events.len());
        for (offset, event) in events.into_iter().enumerate() {
            let sequence = current + offset as u64 + 1;
            sqlx::query(
                r#"
                INSERT INTO events (stream_id, event_type, event_name, sequence, payload)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(stream_id.as_str())
            .bind(event_type)
            .bind(&event.event_name)
            .bind(sequence as i64)
            .bind(&event.payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    EventStoreError::ConcurrencyConflict {
                        stream_id: stream_id.clone(),
                        expected: expected_version,
                        actual: sequence,
                    }
                } else {
                    map_sqlx_error("insert_event", e)
                }
            })?;

            committed.push(Event {
                stream_id: stream_id.clone(),
                event_type: event_type.to_string(),
                event_name: event.event_name,
                sequence,
                payload: event.payload,
            });
        }

        tx.commit().await.map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(committed)
    }

    #[instrument(skip_all, fields(stream_id = %stream_id, event_count), err)]
    async fn load_stream(&self, stream_id: &StreamId) -> Result<Vec<Event>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT position, stream_id, event_type, event_name, sequence, payload
            FROM events
            WHERE stream_id = $1
            ORDER BY sequence ASC
            "#,
        )
        .bind(stream_id.as_str())
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| map_sqlx_error("load_stream", e))?;

        let events = rows
            .iter()
            .map(|row| decode_row(row).map(|r| r.event))
            .collect::<Result<Vec<_>, _>>()?;
        Span::current().record("event_count", events.len());
        Ok(events)
    }

    async fn load_page(&self, after: Cursor, limit: usize) -> Result<EventPage, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT position, stream_id, event_type, event_name, sequence, payload
            FROM events
            WHERE position > $1
            ORDER BY position ASC
            LIMIT $2
            "#,
        )
        .bind(after.position() as i64)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| map_sqlx_error("read_all", e))?;

        let events = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;
        let next_cursor = events.last().map(RecordedEvent::cursor).unwrap_or(after);
        Ok(EventPage { events, next_cursor })
    }
}

impl EventStore for PostgresEventStore {
    fn append(
        &self,
        stream_id: &StreamId,
        event_type: &str,
        expected_version: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<Event>, EventStoreError> {
        validate_batch(event_type, &events)?;
        if events.is_empty() {
            let current = self.stream_version(stream_id)?;
            if !expected_version.matches(current) {
                return Err(EventStoreError::ConcurrencyConflict {
                    stream_id: stream_id.clone(),
                    expected: expected_version,
                    actual: current,
                });
            }
            return Ok(vec![]);
        }
        self.db
            .block_on(self.append_events(stream_id, event_type, expected_version, events))
    }

    fn read(&self, stream_id: &StreamId) -> Result<Vec<Event>, EventStoreError> {
        self.db.block_on(self.load_stream(stream_id))
    }

    fn read_all(&self, after: Cursor, limit: usize) -> Result<EventPage, EventStoreError> {
        self.db.block_on(self.load_page(after, limit))
    }

    fn stream_version(&self, stream_id: &StreamId) -> Result<u64, EventStoreError> {
        self.db.block_on(async {
            let row = sqlx::query("SELECT COALESCE(MAX(sequence), 0) AS version FROM events WHERE stream_id = $1")
                .bind(stream_id.as_str())
                .fetch_one(self.db.pool())
                .await
                .map_err(|e| map_sqlx_error("stream_version", e))?;
            let version: i64 = row
                .try_get("version")
                .map_err(|e| map_sqlx_error("stream_version", e))?;
            Ok(version as u64)
        })
    }
}

/// Returns `(current_version, event_type)`; `(0, None)` when the stream does
/// not exist.
async fn check_stream_version(
    tx: &mut Transaction<'_, Postgres>,
    stream_id: &StreamId,
) -> Result<(u64, Option<String>), EventStoreError> {
    let row = sqlx::query(
        r#"
        SELECT COALESCE(MAX(sequence), 0) AS current_version, MIN(event_type) AS event_type
        FROM events
        WHERE stream_id = $1
        "#,
    )
    .bind(stream_id.as_str())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("check_stream_version", e))?;

    let current: i64 = row
        .try_get("current_version")
        .map_err(|e| map_sqlx_error("check_stream_version", e))?;
    let event_type: Option<String> = row
        .try_get("event_type")
        .map_err(|e| map_sqlx_error("check_stream_version", e))?;
    Ok((current as u64, event_type))
}

fn decode_row(row: &PgRow) -> Result<RecordedEvent, EventStoreError> {
    let decode = |e: sqlx::Error| EventStoreError::Backend(format!("failed to decode event row: {e}"));

    let stream_id: String = row.try_get("stream_id").map_err(decode)?;
    let position: i64 = row.try_get("position").map_err(decode)?;
    let sequence: i64 = row.try_get("sequence").map_err(decode)?;

    Ok(RecordedEvent {
        position: position as u64,
        event: Event {
            stream_id: StreamId::new(stream_id)
                .map_err(|e| EventStoreError::Backend(format!("stored stream id is invalid: {e}")))?,
            event_type: row.try_get("event_type").map_err(decode)?,
            event_name: row.try_get("event_name").map_err(decode)?,
            sequence: sequence as u64,
            payload: row.try_get("payload").map_err(decode)?,
        },
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23514") => EventStoreError::InvalidAppend(msg),
                _ => EventStoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => EventStoreError::Backend(format!("connection pool closed in {operation}")),
        other => EventStoreError::Backend(format!("sqlx error in {operation}: {other}")),
    }
}
