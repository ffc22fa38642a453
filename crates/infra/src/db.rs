//! Postgres connection wiring shared by the durable adapters.
//!
//! The store traits are synchronous, so the backend owns a dedicated tokio
//! runtime and blocks on it. Calls must therefore come from plain threads,
//! never from inside another async runtime.

use std::future::Future;
use std::sync::Arc;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tokio::runtime::Runtime;
use tracing::info;

/// Idempotent DDL for the event log, idempotency records and consumer cursors.
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS events (
        position     BIGSERIAL PRIMARY KEY,
        stream_id    TEXT        NOT NULL,
        event_type   TEXT        NOT NULL,
        event_name   TEXT        NOT NULL,
        sequence     BIGINT      NOT NULL CHECK (sequence > 0),
        payload      JSONB       NOT NULL,
        recorded_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (stream_id, sequence)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS processed_events (
        event_name    TEXT        NOT NULL,
        stream_id     TEXT        NOT NULL,
        sequence      BIGINT      NOT NULL,
        subscriber_id TEXT        NOT NULL,
        state         TEXT        NOT NULL CHECK (state IN ('in_flight', 'done')),
        claimed_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        completed_at  TIMESTAMPTZ,
        PRIMARY KEY (event_name, stream_id, sequence, subscriber_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS consumer_cursors (
        consumer    TEXT        PRIMARY KEY,
        position    BIGINT      NOT NULL CHECK (position >= 0),
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
];

#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to start database runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Connection pool plus the runtime that drives it.
#[derive(Debug, Clone)]
pub struct PgBackend {
    pool: PgPool,
    runtime: Arc<Runtime>,
}

impl PgBackend {
    pub fn connect(database_url: &str) -> Result<Self, DbError> {
        Self::connect_with(database_url, 8)
    }

    pub fn connect_with(database_url: &str, max_connections: u32) -> Result<Self, DbError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("covenant-db")
            .enable_all()
            .build()?;

        let pool = runtime.block_on(
            PgPoolOptions::new()
                .max_connections(max_connections)
                .connect(database_url),
        )?;

        Ok(Self {
            pool,
            runtime: Arc::new(runtime),
        })
    }

    /// Create the tables if they do not exist yet.
    pub fn ensure_schema(&self) -> Result<(), DbError> {
        self.block_on(async {
            for statement in SCHEMA {
                sqlx::query(*statement).execute(&self.pool).await?;
            }
            Ok::<_, sqlx::Error>(())
        })?;
        info!(tables = SCHEMA.len(), "database schema ensured");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

/// Unique violation (`23505`).
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
