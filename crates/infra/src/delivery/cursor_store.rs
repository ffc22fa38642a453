//! Consumer cursor persistence.
//!
//! A cursor records how far a named consumer (a subscriber id, for
//! [`EventFeed`](super::EventFeed)) has followed the global event
//! log. It enables:
//! - Resume after crash (continue from the last saved position)
//! - Deterministic rebuilds (reset and replay from the start)
//!
//! Cursors only move forward; a stale writer can never rewind one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::event_store::Cursor;

#[derive(Debug, Error)]
pub enum CursorStoreError {
    #[error("cursor store lock poisoned")]
    Poisoned,

    #[error("cursor store backend failure: {0}")]
    Backend(String),
}

pub trait CursorStore: Send + Sync {
    /// Last saved position for `consumer`, or [`Cursor::START`].
    fn load(&self, consumer: &str) -> Result<Cursor, CursorStoreError>;

    /// Advance `consumer` to `cursor` (ignored if it would move backwards).
    fn save(&self, consumer: &str, cursor: Cursor) -> Result<(), CursorStoreError>;

    /// Rewind `consumer` to the start (for rebuilds).
    fn reset(&self, consumer: &str) -> Result<(), CursorStoreError>;
}

impl<C> CursorStore for Arc<C>
where
    C: CursorStore + ?Sized,
{
    fn load(&self, consumer: &str) -> Result<Cursor, CursorStoreError> {
        (**self).load(consumer)
    }

    fn save(&self, consumer: &str, cursor: Cursor) -> Result<(), CursorStoreError> {
        (**self).save(consumer, cursor)
    }

    fn reset(&self, consumer: &str) -> Result<(), CursorStoreError> {
        (**self).reset(consumer)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCursorStore {
    cursors: Mutex<HashMap<String, Cursor>>,
}

impl InMemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CursorStore for InMemoryCursorStore {
    fn load(&self, consumer: &str) -> Result<Cursor, CursorStoreError> {
        let cursors = self.cursors.lock().map_err(|_| CursorStoreError::Poisoned)?;
        Ok(cursors.get(consumer).copied().unwrap_or(Cursor::START))
    }

    fn save(&self, consumer: &str, cursor: Cursor) -> Result<(), CursorStoreError> {
        let mut cursors = self.cursors.lock().map_err(|_| CursorStoreError::Poisoned)?;
        let entry = cursors.entry(consumer.to_string()).or_default();
        *entry = (*entry).max(cursor);
        Ok(())
    }

    fn reset(&self, consumer: &str) -> Result<(), CursorStoreError> {
        let mut cursors = self.cursors.lock().map_err(|_| CursorStoreError::Poisoned)?;
        cursors.remove(consumer);
        Ok(())
    }
}

#[cfg(feature = "postgres")]
pub use self::postgres::PostgresCursorStore;

#[cfg(feature = "postgres")]
mod postgres {
    use sqlx::Row;

    use super::{CursorStore, CursorStoreError};
    use crate::db::PgBackend;
    use crate::event_store::Cursor;

    /// Postgres-backed cursor store (`consumer_cursors` table).
    #[derive(Debug, Clone)]
    pub struct PostgresCursorStore {
        db: PgBackend,
    }

    impl PostgresCursorStore {
        pub fn new(db: PgBackend) -> Self {
            Self { db }
        }
    }

    fn backend(operation: &str, err: sqlx::Error) -> CursorStoreError {
        CursorStoreError::Backend(format!("{operation}: {err}"))
    }

    impl CursorStore for PostgresCursorStore {
        fn load(&self, consumer: &str) -> Result<Cursor, CursorStoreError> {
            self.db.block_on(async {
                let row = sqlx::query("SELECT position FROM consumer_cursors WHERE consumer = $1")
                    .bind(consumer)
                    .fetch_optional(self.db.pool())
                    .await
                    .map_err(|e| backend("load_cursor", e))?;
                match row {
                    Some(row) => {
                        let position: i64 = row.try_get("position").map_err(|e| backend("load_cursor", e))?;
                        Ok(Cursor(position as u64))
                    }
                    None => Ok(Cursor::START),
                }
            })
        }

        fn save(&self, consumer: &str, cursor: Cursor) -> Result<(), CursorStoreError> {
            self.db.block_on(async {
                sqlx::query(
                    r#"
                    INSERT INTO consumer_cursors (consumer, position)
                    VALUES ($1, $2)
                    ON CONFLICT (consumer)
                    DO UPDATE SET
                        position = GREATEST(consumer_cursors.position, EXCLUDED.position),
                        updated_at = NOW()
                    "#,
                )
                .bind(consumer)
                .bind(cursor.position() as i64)
                .execute(self.db.pool())
                .await
                .map_err(|e| backend("save_cursor", e))?;
                Ok(())
            })
        }

        fn reset(&self, consumer: &str) -> Result<(), CursorStoreError> {
            self.db.block_on(async {
                sqlx::query("DELETE FROM consumer_cursors WHERE consumer = $1")
                    .bind(consumer)
                    .execute(self.db.pool())
                    .await
                    .map_err(|e| backend("reset_cursor", e))?;
                Ok(())
            })
        }
    }
}
