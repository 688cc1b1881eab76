//! Durable queue broker backed by the `photo_search_jobs` table.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    DeadLetter, Delivery, DeliveryTag, QueueBroker, QueueConfig,
    QueueSnapshot, RejectOutcome,
};
use crate::error::QueueError;

/// SQLSTATE raised when `statement_timeout` cancels a statement.
const QUERY_CANCELED: &str = "57014";

/// Postgres broker: rows move `ready -> leased -> completed | dead_letter`.
///
/// Consumers lease with `FOR UPDATE SKIP LOCKED`, so several workers can
/// share a queue. A lease that outlives `lease_ttl` (crashed worker) is
/// returned to `ready`, or dead-lettered once it has used its attempts.
#[derive(Clone)]
pub struct PostgresQueueBroker {
    pool: PgPool,
    config: QueueConfig,
}

impl fmt::Debug for PostgresQueueBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresQueueBroker")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .field("config", &self.config)
            .finish()
    }
}

#[derive(FromRow)]
struct LeasedRow {
    body: Vec<u8>,
    attempts: i32,
    lease_id: Uuid,
    created_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct DeadLetterRow {
    id: Uuid,
    body: Vec<u8>,
    attempts: i32,
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
}

impl PostgresQueueBroker {
    /// Connect the broker, verifying database health and schema.
    pub async fn new(
        pool: PgPool,
        config: QueueConfig,
    ) -> Result<Self, QueueError> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| {
                QueueError::Internal(format!(
                    "queue broker failed Postgres health check: {e}"
                ))
            })?;

        let table_exists: bool = sqlx::query_scalar(
            "SELECT to_regclass('photo_search_jobs') IS NOT NULL",
        )
        .fetch_one(&pool)
        .await?;
        if !table_exists {
            return Err(QueueError::Internal(
                "table photo_search_jobs is missing; run migrations".into(),
            ));
        }

        info!(queue = %config.name, "queue broker connected to Postgres");
        Ok(Self { pool, config })
    }

    /// Pool the broker runs on.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Return expired leases to `ready`, dead-lettering those out of
    /// attempts. Returns the number of rows made ready again.
    pub async fn reclaim_expired_leases(&self) -> Result<u64, QueueError> {
        let dead = sqlx::query(
            r#"
            UPDATE photo_search_jobs
            SET state = 'dead_letter',
                attempts = attempts + 1,
                lease_id = NULL,
                lease_expires_at = NULL,
                last_error = COALESCE(last_error, 'lease expired (max attempts)'),
                updated_at = NOW()
            WHERE queue = $1
              AND state = 'leased'
              AND lease_expires_at < NOW()
              AND attempts + 1 >= $2
            "#,
        )
        .bind(&self.config.name)
        .bind(self.max_attempts())
        .execute(&self.pool)
        .await?
        .rows_affected();

        let resurrected = sqlx::query(
            r#"
            UPDATE photo_search_jobs
            SET state = 'ready',
                attempts = attempts + 1,
                lease_id = NULL,
                lease_expires_at = NULL,
                last_error = COALESCE(last_error, 'lease expired'),
                updated_at = NOW()
            WHERE queue = $1
              AND state = 'leased'
              AND lease_expires_at < NOW()
            "#,
        )
        .bind(&self.config.name)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if dead > 0 {
            warn!(queue = %self.config.name, count = dead, "expired leases dead-lettered");
        }
        if resurrected > 0 {
            info!(queue = %self.config.name, count = resurrected, "expired leases returned to ready");
        }
        Ok(resurrected)
    }

    fn max_attempts(&self) -> i32 {
        i32::try_from(self.config.max_attempts).unwrap_or(i32::MAX)
    }

    /// Reclaim and lease on a spawned task. If the caller is dropped before
    /// the row comes back, the lease is released instead of sitting out its
    /// ttl.
    async fn lease_detached(&self) -> Result<Option<Delivery>, QueueError> {
        let (tx, rx) = oneshot::channel();
        let broker = self.clone();
        tokio::spawn(async move {
            let leased = match broker.reclaim_expired_leases().await {
                Ok(_) => broker.try_lease().await,
                Err(err) => Err(err),
            };
            if let Err(Ok(Some(delivery))) = tx.send(leased) {
                match broker.release(delivery.tag).await {
                    Ok(_) => debug!(
                        queue = %broker.config.name,
                        tag = %delivery.tag,
                        "receiver gone; lease released"
                    ),
                    Err(err) => warn!(
                        queue = %broker.config.name,
                        tag = %delivery.tag,
                        error = %err,
                        "failed to release abandoned lease"
                    ),
                }
            }
        });
        rx.await
            .map_err(|_| QueueError::Internal("lease task stopped".into()))?
    }

    fn publish_error(&self, err: sqlx::Error) -> QueueError {
        match &err {
            sqlx::Error::Database(db) if db.code().as_deref() == Some(QUERY_CANCELED) => {
                QueueError::PublishTimeout(self.config.publish_timeout())
            }
            _ => QueueError::Database(err),
        }
    }

    async fn try_lease(&self) -> Result<Option<Delivery>, QueueError> {
        let lease_id = Uuid::now_v7();
        let lease_ttl_ms = i64::try_from(self.config.lease_ttl_ms).unwrap_or(i64::MAX);

        let row = sqlx::query_as::<_, LeasedRow>(
            r#"
            WITH next AS (
                SELECT id
                FROM photo_search_jobs
                WHERE queue = $1 AND state = 'ready'
                ORDER BY created_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            UPDATE photo_search_jobs j
            SET state = 'leased',
                lease_id = $2,
                lease_expires_at = NOW() + ($3::bigint) * INTERVAL '1 millisecond',
                updated_at = NOW()
            FROM next
            WHERE j.id = next.id
            RETURNING j.body, j.attempts, j.lease_id AS "lease_id", j.created_at
            "#,
        )
        .bind(&self.config.name)
        .bind(lease_id)
        .bind(lease_ttl_ms)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Delivery {
            tag: DeliveryTag(row.lease_id),
            body: row.body,
            attempt: u32::try_from(row.attempts).unwrap_or(0) + 1,
            enqueued_at: row.created_at,
        }))
    }
}

#[async_trait]
impl QueueBroker for PostgresQueueBroker {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn publish(&self, body: Vec<u8>) -> Result<(), QueueError> {
        if self.pool.is_closed() {
            return Err(QueueError::Closed);
        }
        let mut tx = self.pool.begin().await?;

        // Server-side bound: a timed-out insert is rolled back, never
        // committed behind the caller's back.
        sqlx::query(&format!(
            "SET LOCAL statement_timeout = {}",
            self.config.publish_timeout_ms
        ))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO photo_search_jobs (id, queue, body, state, attempts)
            VALUES ($1, $2, $3, 'ready', 0)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&self.config.name)
        .bind(body)
        .execute(&mut *tx)
        .await
        .map_err(|e| self.publish_error(e))?;

        tx.commit().await.map_err(|e| self.publish_error(e))?;
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        loop {
            if self.pool.is_closed() {
                return Ok(None);
            }

            match self.lease_detached().await {
                Ok(Some(delivery)) => {
                    debug!(
                        queue = %self.config.name,
                        tag = %delivery.tag,
                        attempt = delivery.attempt,
                        "leased message"
                    );
                    return Ok(Some(delivery));
                }
                Ok(None) => {}
                Err(QueueError::Database(sqlx::Error::PoolClosed)) => {
                    return Ok(None);
                }
                Err(err) => return Err(err),
            }

            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), QueueError> {
        let res = sqlx::query(
            r#"
            UPDATE photo_search_jobs
            SET state = 'completed',
                lease_id = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE lease_id = $1 AND state = 'leased'
            "#,
        )
        .bind(tag.0)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            warn!(queue = %self.config.name, tag = %tag, "ack for unknown or expired lease");
        }
        Ok(())
    }

    async fn release(&self, tag: DeliveryTag) -> Result<bool, QueueError> {
        let res = sqlx::query(
            r#"
            UPDATE photo_search_jobs
            SET state = 'ready',
                lease_id = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE lease_id = $1 AND state = 'leased'
            "#,
        )
        .bind(tag.0)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn reject(
        &self,
        tag: DeliveryTag,
        requeue: bool,
        reason: Option<String>,
    ) -> Result<RejectOutcome, QueueError> {
        let mut tx = self.pool.begin().await?;

        let attempts: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT attempts
            FROM photo_search_jobs
            WHERE lease_id = $1 AND state = 'leased'
            FOR UPDATE
            "#,
        )
        .bind(tag.0)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(attempts) = attempts else {
            drop(tx);
            return Ok(RejectOutcome::LeaseLost);
        };

        let attempts = attempts.saturating_add(1);
        let dead = !requeue || attempts >= self.max_attempts();
        let state = if dead { "dead_letter" } else { "ready" };

        sqlx::query(
            r#"
            UPDATE photo_search_jobs
            SET state = $2,
                attempts = $3,
                lease_id = NULL,
                lease_expires_at = NULL,
                last_error = COALESCE($4, last_error),
                updated_at = NOW()
            WHERE lease_id = $1
            "#,
        )
        .bind(tag.0)
        .bind(state)
        .bind(attempts)
        .bind(reason)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let attempts = u32::try_from(attempts).unwrap_or(0);
        if dead {
            warn!(queue = %self.config.name, tag = %tag, attempts, "message moved to dead_letter");
            Ok(RejectOutcome::DeadLettered { attempts })
        } else {
            debug!(queue = %self.config.name, tag = %tag, attempts, "message requeued");
            Ok(RejectOutcome::Requeued { attempts })
        }
    }

    async fn snapshot(&self) -> Result<QueueSnapshot, QueueError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT state, COUNT(*)::bigint AS cnt
            FROM photo_search_jobs
            WHERE queue = $1
            GROUP BY state
            "#,
        )
        .bind(&self.config.name)
        .fetch_all(&self.pool)
        .await?;

        let mut snapshot = QueueSnapshot {
            queue: self.config.name.clone(),
            ready: 0,
            leased: 0,
            completed: 0,
            dead_letter: 0,
            captured_at: Utc::now(),
        };
        for (state, count) in rows {
            let count = u64::try_from(count).unwrap_or(0);
            match state.as_str() {
                "ready" => snapshot.ready = count,
                "leased" => snapshot.leased = count,
                "completed" => snapshot.completed = count,
                "dead_letter" => snapshot.dead_letter = count,
                _ => {}
            }
        }
        Ok(snapshot)
    }

    async fn dead_letters(
        &self,
        limit: u32,
    ) -> Result<Vec<DeadLetter>, QueueError> {
        let rows = sqlx::query_as::<_, DeadLetterRow>(
            r#"
            SELECT id, body, attempts, last_error, updated_at
            FROM photo_search_jobs
            WHERE queue = $1 AND state = 'dead_letter'
            ORDER BY updated_at DESC
            LIMIT $2
            "#,
        )
        .bind(&self.config.name)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| DeadLetter {
                id: row.id,
                payload: String::from_utf8_lossy(&row.body).into_owned(),
                attempts: u32::try_from(row.attempts).unwrap_or(0),
                last_error: row.last_error,
                dead_lettered_at: row.updated_at,
            })
            .collect())
    }
}
