//! Durable idempotency records (`processed_events` table).
//!
//! Claims carry a lease: an `in_flight` row older than the lease is treated as
//! abandoned (the deliverer crashed between claim and completion) and can be
//! taken over, so the event is redelivered rather than lost.

use std::time::Duration;

use sqlx::Row;
use tracing::debug;

use covenant_core::EventKey;
use covenant_events::{Claim, IdempotencyError, ProcessedEvents, SubscriberId};

use crate::db::PgBackend;

#[derive(Debug, Clone)]
pub struct PostgresProcessedEvents {
    db: PgBackend,
    lease: Duration,
}

impl PostgresProcessedEvents {
    pub fn new(db: PgBackend) -> Self {
        Self {
            db,
            lease: Duration::from_secs(300),
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }
}

fn backend(operation: &str, err: sqlx::Error) -> IdempotencyError {
    IdempotencyError::Backend(format!("{operation}: {err}"))
}

impl ProcessedEvents for PostgresProcessedEvents {
    fn claim(&self, event: &EventKey, subscriber: &SubscriberId) -> Result<Claim, IdempotencyError> {
        self.db.block_on(async {
            // Insert a fresh claim, or take over an expired one.
            let acquired = sqlx::query(
                r#"
                INSERT INTO processed_events (event_name, stream_id, sequence, subscriber_id, state)
                VALUES ($1, $2, $3, $4, 'in_flight')
                ON CONFLICT (event_name, stream_id, sequence, subscriber_id)
                DO UPDATE SET claimed_at = NOW()
                WHERE processed_events.state = 'in_flight'
                  AND processed_events.claimed_at < NOW() - make_interval(secs => $5)
                RETURNING state
                "#,
            )
            .bind(&event.event_name)
            .bind(event.stream_id.as_str())
            .bind(event.sequence as i64)
            .bind(subscriber.as_str())
            .bind(self.lease.as_secs_f64())
            .fetch_optional(self.db.pool())
            .await
            .map_err(|e| backend("claim", e))?;

            if acquired.is_some() {
                return Ok(Claim::Acquired);
            }

            let row = sqlx::query(
                r#"
                SELECT state FROM processed_events
                WHERE event_name = $1 AND stream_id = $2 AND sequence = $3 AND subscriber_id = $4
                "#,
            )
            .bind(&event.event_name)
            .bind(event.stream_id.as_str())
            .bind(event.sequence as i64)
            .bind(subscriber.as_str())
            .fetch_optional(self.db.pool())
            .await
            .map_err(|e| backend("claim_state", e))?;

            let state: Option<String> = match row {
                Some(row) => Some(row.try_get("state").map_err(|e| backend("claim_state", e))?),
                None => None,
            };
            match state.as_deref() {
                Some("done") => Ok(Claim::AlreadyProcessed),
                Some(_) => Ok(Claim::InFlight),
                // Released between the two statements; the next delivery retries.
                None => {
                    debug!(event = %event, subscriber = %subscriber, "claim released concurrently");
                    Ok(Claim::InFlight)
                }
            }
        })
    }

    fn complete(&self, event: &EventKey, subscriber: &SubscriberId) -> Result<(), IdempotencyError> {
        self.db.block_on(async {
            let result = sqlx::query(
                r#"
                UPDATE processed_events
                SET state = 'done', completed_at = NOW()
                WHERE event_name = $1 AND stream_id = $2 AND sequence = $3 AND subscriber_id = $4
                "#,
            )
            .bind(&event.event_name)
            .bind(event.stream_id.as_str())
            .bind(event.sequence as i64)
            .bind(subscriber.as_str())
            .execute(self.db.pool())
            .await
            .map_err(|e| backend("complete", e))?;

            if result.rows_affected() == 0 {
                return Err(IdempotencyError::NotClaimed {
                    event: event.clone(),
                    subscriber: subscriber.clone(),
                });
            }
            Ok(())
        })
    }

    fn release(&self, event: &EventKey, subscriber: &SubscriberId) -> Result<(), IdempotencyError> {
        self.db.block_on(async {
            sqlx::query(
                r#"
                DELETE FROM processed_events
                WHERE event_name = $1 AND stream_id = $2 AND sequence = $3 AND subscriber_id = $4
                  AND state = 'in_flight'
                "#,
            )
            .bind(&event.event_name)
            .bind(event.stream_id.as_str())
            .bind(event.sequence as i64)
            .bind(subscriber.as_str())
            .execute(self.db.pool())
            .await
            .map_err(|e| backend("release", e))?;
            Ok(())
        })
    }

    fn is_processed(&self, event: &EventKey, subscriber: &SubscriberId) -> Result<bool, IdempotencyError> {
        self.db.block_on(async {
            let row = sqlx::query(
                r#"
                SELECT 1 AS hit FROM processed_events
                WHERE event_name = $1 AND stream_id = $2 AND sequence = $3 AND subscriber_id = $4
                  AND state = 'done'
                "#,
            )
            .bind(&event.event_name)
            .bind(event.stream_id.as_str())
            .bind(event.sequence as i64)
            .bind(subscriber.as_str())
            .fetch_optional(self.db.pool())
            .await
            .map_err(|e| backend("is_processed", e))?;
            Ok(row.is_some())
        })
    }
}
