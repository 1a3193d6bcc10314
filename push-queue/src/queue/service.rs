//! Queue service: enqueue, atomic claim and outcome reporting.

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{NotificationPayload, NotificationQueueTxOps};
use crate::config::QueueConfig;
use crate::database::models::{
    ClaimedDelivery, ClaimedDeliveryRow, DeliveryStatus, DeliveryStatusCounts,
};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::{lease_deadline_ms, now_ms};
use crate::database::{DbPool, WritePool, begin_immediate};
use crate::{Error, Result};

/// Joined view of the deliveries a claim just leased, oldest first.
const CLAIMED_ROWS_SQL: &str = r#"
    SELECT
        d.id AS delivery_id,
        d.notification_id,
        d.subscription_id,
        d.endpoint,
        d.status,
        d.retries,
        d.created_at AS delivery_created_at,
        d.locked_by,
        d.locked_until,
        n.user_id,
        n.title,
        n.message,
        n.metadata,
        n.navigate,
        n.created_at AS notification_created_at,
        s.user_id AS subscription_user_id,
        s.p256dh,
        s.auth
    FROM notification_delivery d
    INNER JOIN notification n ON n.id = d.notification_id
    LEFT JOIN push_subscription s ON s.id = d.subscription_id
    WHERE d.id IN (SELECT value FROM json_each(?))
    ORDER BY d.created_at, d.rowid
"#;

/// Notification queue trait.
#[async_trait]
pub trait NotificationQueue: Send + Sync {
    /// Fan a payload out to every current subscription of `user_id` in one
    /// transaction. Returns the notification id.
    async fn enqueue_single(&self, user_id: &str, payload: &NotificationPayload)
    -> Result<String>;

    /// Record a notification that has no recipient.
    async fn enqueue_broadcast(&self, payload: &NotificationPayload) -> Result<String>;

    /// Lease up to `batch_size` eligible deliveries to `instance_id`.
    ///
    /// Eligible means `pending`, or `processing` with an expired lease.
    /// Returns an empty batch when nothing is available.
    async fn claim(&self, batch_size: usize, instance_id: &str) -> Result<Vec<ClaimedDelivery>>;

    // Outcome reports only apply while `instance_id` still holds the lease,
    // so a worker whose lease was taken over cannot touch the new holder's row.

    /// Record a successful send. Repeating it is a no-op.
    async fn mark_sent(&self, delivery_id: &str, instance_id: &str) -> Result<()>;

    /// Record a transient failure. Returns the resulting status: `Pending`
    /// while retries remain, `Failed` once the cap is reached, `None` if the
    /// row was already terminal, is leased to another instance or does not
    /// exist.
    async fn mark_failed(
        &self,
        delivery_id: &str,
        instance_id: &str,
    ) -> Result<Option<DeliveryStatus>>;

    /// Record that the endpoint can never be delivered to; terminal at once.
    async fn mark_undeliverable(&self, delivery_id: &str, instance_id: &str) -> Result<()>;

    async fn status_counts(&self) -> Result<DeliveryStatusCounts>;
}

/// SQLx implementation of NotificationQueue.
pub struct SqlxNotificationQueue {
    read_pool: DbPool,
    write_pool: WritePool,
    config: QueueConfig,
}

impl SqlxNotificationQueue {
    pub fn new(read_pool: DbPool, write_pool: WritePool, config: QueueConfig) -> Self {
        Self {
            read_pool,
            write_pool,
            config,
        }
    }

    /// Claim as of `now_ms`. A lease is reclaimable only once
    /// `now_ms > locked_until`.
    pub async fn claim_at(
        &self,
        batch_size: usize,
        instance_id: &str,
        now_ms: i64,
    ) -> Result<Vec<ClaimedDelivery>> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);
        let locked_until = lease_deadline_ms(now_ms, self.config.lease_duration);

        let claimed = retry_on_sqlite_busy("claim deliveries", || {
            self.try_claim(limit, instance_id, now_ms, locked_until)
        })
        .await?;

        if !claimed.is_empty() {
            debug!(
                instance_id = %instance_id,
                count = claimed.len(),
                locked_until,
                "Claimed deliveries"
            );
        }

        Ok(claimed)
    }

    async fn try_claim(
        &self,
        limit: i64,
        instance_id: &str,
        now_ms: i64,
        locked_until: i64,
    ) -> Result<Vec<ClaimedDelivery>> {
        let mut tx = begin_immediate(&self.write_pool).await?;

        // Select-and-lease is one statement under the write lock, so two
        // claimers can never both see the same row as eligible.
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE notification_delivery
            SET status = 'processing', locked_by = ?, locked_until = ?
            WHERE id IN (
                SELECT id FROM notification_delivery
                WHERE status = 'pending'
                   OR (status = 'processing'
                       AND (locked_until IS NULL OR locked_until < ?))
                ORDER BY created_at, rowid
                LIMIT ?
            )
            RETURNING id
            "#,
        )
        .bind(instance_id)
        .bind(locked_until)
        .bind(now_ms)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, ClaimedDeliveryRow>(CLAIMED_ROWS_SQL)
            .bind(serde_json::to_string(&ids)?)
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(rows.into_iter().map(ClaimedDelivery::from).collect())
    }
}

#[async_trait]
impl NotificationQueue for SqlxNotificationQueue {
    async fn enqueue_single(
        &self,
        user_id: &str,
        payload: &NotificationPayload,
    ) -> Result<String> {
        if user_id.trim().is_empty() {
            return Err(Error::validation("Recipient user id must not be empty"));
        }

        let mut tx = begin_immediate(&self.write_pool).await?;
        let ids = NotificationQueueTxOps::enqueue_bulk(&mut tx, &[user_id], payload).await?;
        tx.commit().await?;

        ids.into_iter()
            .next()
            .ok_or_else(|| Error::Other("Enqueue produced no notification".to_string()))
    }

    async fn enqueue_broadcast(&self, payload: &NotificationPayload) -> Result<String> {
        let mut tx = begin_immediate(&self.write_pool).await?;
        let id = NotificationQueueTxOps::enqueue_broadcast(&mut tx, payload).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn claim(&self, batch_size: usize, instance_id: &str) -> Result<Vec<ClaimedDelivery>> {
        self.claim_at(batch_size, instance_id, now_ms()).await
    }

    async fn mark_sent(&self, delivery_id: &str, instance_id: &str) -> Result<()> {
        let result = retry_on_sqlite_busy("mark delivery sent", || async {
            Ok(sqlx::query(
                r#"
                UPDATE notification_delivery
                SET status = 'sent', locked_by = NULL, locked_until = NULL
                WHERE id = ? AND status <> 'failed'
                  AND (locked_by IS NULL OR locked_by = ?)
                "#,
            )
            .bind(delivery_id)
            .bind(instance_id)
            .execute(&self.write_pool)
            .await?)
        })
        .await?;

        if result.rows_affected() == 0 {
            debug!(
                delivery_id = %delivery_id,
                instance_id = %instance_id,
                "mark_sent matched no delivery held by this instance"
            );
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        delivery_id: &str,
        instance_id: &str,
    ) -> Result<Option<DeliveryStatus>> {
        let max_retries = i64::from(self.config.max_retries);

        // `retries` on the right-hand side is the pre-update value.
        let status: Option<String> = retry_on_sqlite_busy("mark delivery failed", || async {
            Ok(sqlx::query_scalar(
                r#"
                UPDATE notification_delivery
                SET retries = retries + 1,
                    status = CASE WHEN retries + 1 >= ? THEN 'failed' ELSE 'pending' END,
                    locked_by = NULL,
                    locked_until = NULL
                WHERE id = ? AND status IN ('pending', 'processing')
                  AND (locked_by IS NULL OR locked_by = ?)
                RETURNING status
                "#,
            )
            .bind(max_retries)
            .bind(delivery_id)
            .bind(instance_id)
            .fetch_optional(&self.write_pool)
            .await?)
        })
        .await?;

        let status = status.as_deref().and_then(DeliveryStatus::parse);
        if status == Some(DeliveryStatus::Failed) {
            warn!(
                delivery_id = %delivery_id,
                max_retries = self.config.max_retries,
                "Delivery exhausted its retries"
            );
        }
        Ok(status)
    }

    async fn mark_undeliverable(&self, delivery_id: &str, instance_id: &str) -> Result<()> {
        let result = retry_on_sqlite_busy("mark delivery undeliverable", || async {
            Ok(sqlx::query(
                r#"
                UPDATE notification_delivery
                SET retries = retries + 1,
                    status = 'failed',
                    locked_by = NULL,
                    locked_until = NULL
                WHERE id = ? AND status IN ('pending', 'processing')
                  AND (locked_by IS NULL OR locked_by = ?)
                "#,
            )
            .bind(delivery_id)
            .bind(instance_id)
            .execute(&self.write_pool)
            .await?)
        })
        .await?;

        if result.rows_affected() == 0 {
            debug!(
                delivery_id = %delivery_id,
                instance_id = %instance_id,
                "mark_undeliverable matched no delivery held by this instance"
            );
        }
        Ok(())
    }

    async fn status_counts(&self) -> Result<DeliveryStatusCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM notification_delivery GROUP BY status",
        )
        .fetch_all(&self.read_pool)
        .await?;

        let mut counts = DeliveryStatusCounts::default();
        for (status, count) in rows {
            let count = u64::try_from(count).unwrap_or(0);
            match DeliveryStatus::parse(&status) {
                Some(DeliveryStatus::Pending) => counts.pending = count,
                Some(DeliveryStatus::Processing) => counts.processing = count,
                Some(DeliveryStatus::Sent) => counts.sent = count,
                Some(DeliveryStatus::Failed) => counts.failed = count,
                None => warn!(status = %status, "Unknown delivery status in store"),
            }
        }
        Ok(counts)
    }
}
