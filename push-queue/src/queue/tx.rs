//! Transactional enqueue operations.
//!
//! These methods write through the caller's connection and do NOT commit.
//! The caller owns the transaction boundary, so a fan-out can roll back
//! together with whatever domain change triggered it.

use std::collections::{HashMap, HashSet};

use sqlx::SqliteConnection;
use tracing::debug;

use super::NotificationPayload;
use crate::Result;
use crate::database::models::{DeliveryDbModel, NotificationDbModel, PushSubscriptionDbModel};
use crate::database::repositories::SubscriptionTxOps;
use crate::database::time::now_ms;

/// Transactional operations for the notification queue.
pub struct NotificationQueueTxOps;

impl NotificationQueueTxOps {
    /// Fan a payload out to every subscription of every user in `user_ids`.
    ///
    /// Creates one notification per distinct user (first occurrence order) and
    /// one pending delivery per subscription. Users without subscriptions
    /// still get their notification row. An empty `user_ids` writes nothing.
    /// Returns the created notification ids.
    pub async fn enqueue_bulk(
        tx: &mut SqliteConnection,
        user_ids: &[&str],
        payload: &NotificationPayload,
    ) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let users: Vec<&str> = user_ids
            .iter()
            .copied()
            .filter(|user_id| seen.insert(*user_id))
            .collect();
        if users.is_empty() {
            return Ok(Vec::new());
        }

        let subscriptions = SubscriptionTxOps::list_for_users(tx, &users).await?;
        let mut by_user: HashMap<&str, Vec<&PushSubscriptionDbModel>> = HashMap::new();
        for subscription in &subscriptions {
            by_user
                .entry(subscription.user_id.as_str())
                .or_default()
                .push(subscription);
        }

        let now = now_ms();
        let mut notification_ids = Vec::with_capacity(users.len());
        let mut delivery_count = 0usize;

        for user_id in users {
            let notification = NotificationDbModel::new(Some(user_id.to_string()), payload, now);
            Self::insert_notification(tx, &notification).await?;

            for subscription in by_user.get(user_id).into_iter().flatten() {
                let delivery = DeliveryDbModel::new_pending(
                    &notification.id,
                    &subscription.id,
                    &subscription.endpoint,
                    now,
                );
                Self::insert_delivery(tx, &delivery).await?;
                delivery_count += 1;
            }

            notification_ids.push(notification.id);
        }

        debug!(
            notifications = notification_ids.len(),
            deliveries = delivery_count,
            "Enqueued notification fan-out"
        );

        Ok(notification_ids)
    }

    /// Record a notification with no recipient and therefore no deliveries.
    pub async fn enqueue_broadcast(
        tx: &mut SqliteConnection,
        payload: &NotificationPayload,
    ) -> Result<String> {
        let notification = NotificationDbModel::new(None, payload, now_ms());
        Self::insert_notification(tx, &notification).await?;
        Ok(notification.id)
    }

    async fn insert_notification(
        tx: &mut SqliteConnection,
        notification: &NotificationDbModel,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notification (id, user_id, title, message, metadata, navigate, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&notification.id)
        .bind(&notification.user_id)
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(&notification.metadata)
        .bind(&notification.navigate)
        .bind(notification.created_at)
        .execute(&mut *tx)
        .await?;
        Ok(())
    }

    async fn insert_delivery(tx: &mut SqliteConnection, delivery: &DeliveryDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notification_delivery (
                id, notification_id, subscription_id, endpoint, status, retries, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&delivery.id)
        .bind(&delivery.notification_id)
        .bind(&delivery.subscription_id)
        .bind(&delivery.endpoint)
        .bind(&delivery.status)
        .bind(delivery.retries)
        .bind(delivery.created_at)
        .execute(&mut *tx)
        .await?;
        Ok(())
    }
}
