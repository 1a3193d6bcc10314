//! Push subscription repository.
//!
//! The queue reads subscriptions during fan-out and removes endpoints that
//! the push service reports as gone; everything else here exists so the
//! store can be driven end to end.

use async_trait::async_trait;
use sqlx::SqliteConnection;

use crate::database::models::PushSubscriptionDbModel;
use crate::database::{DbPool, WritePool};
use crate::{Error, Result};

/// Subscription store trait.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Register an endpoint for a user. An existing endpoint is re-owned by
    /// `user_id` and its keys replaced.
    async fn upsert(
        &self,
        user_id: &str,
        endpoint: &str,
        p256dh: &str,
        auth: &str,
    ) -> Result<PushSubscriptionDbModel>;
    async fn get(&self, id: &str) -> Result<PushSubscriptionDbModel>;
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<PushSubscriptionDbModel>>;
    /// Remove an endpoint regardless of owner. Returns whether a row was deleted.
    async fn delete_by_endpoint(&self, endpoint: &str) -> Result<bool>;
    async fn unsubscribe(&self, user_id: &str, endpoint: &str) -> Result<()>;
}

/// SQLx implementation of SubscriptionStore.
pub struct SqlxSubscriptionStore {
    read_pool: DbPool,
    write_pool: WritePool,
}

impl SqlxSubscriptionStore {
    pub fn new(read_pool: DbPool, write_pool: WritePool) -> Self {
        Self {
            read_pool,
            write_pool,
        }
    }
}

#[async_trait]
impl SubscriptionStore for SqlxSubscriptionStore {
    async fn upsert(
        &self,
        user_id: &str,
        endpoint: &str,
        p256dh: &str,
        auth: &str,
    ) -> Result<PushSubscriptionDbModel> {
        if endpoint.trim().is_empty() {
            return Err(Error::validation("Subscription endpoint must not be empty"));
        }

        let candidate = PushSubscriptionDbModel::new(user_id, endpoint, p256dh, auth);
        let row = sqlx::query_as::<_, PushSubscriptionDbModel>(
            r#"
            INSERT INTO push_subscription (id, user_id, endpoint, p256dh, auth, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(endpoint) DO UPDATE SET
                user_id = excluded.user_id,
                p256dh = excluded.p256dh,
                auth = excluded.auth
            RETURNING *
            "#,
        )
        .bind(&candidate.id)
        .bind(&candidate.user_id)
        .bind(&candidate.endpoint)
        .bind(&candidate.p256dh)
        .bind(&candidate.auth)
        .bind(candidate.created_at)
        .fetch_one(&self.write_pool)
        .await?;

        Ok(row)
    }

    async fn get(&self, id: &str) -> Result<PushSubscriptionDbModel> {
        sqlx::query_as::<_, PushSubscriptionDbModel>(
            "SELECT * FROM push_subscription WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.read_pool)
        .await?
        .ok_or_else(|| Error::not_found("PushSubscription", id))
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<PushSubscriptionDbModel>> {
        let rows = sqlx::query_as::<_, PushSubscriptionDbModel>(
            "SELECT * FROM push_subscription WHERE user_id = ? ORDER BY created_at, id",
        )
        .bind(user_id)
        .fetch_all(&self.read_pool)
        .await?;
        Ok(rows)
    }

    async fn delete_by_endpoint(&self, endpoint: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM push_subscription WHERE endpoint = ?")
            .bind(endpoint)
            .execute(&self.write_pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn unsubscribe(&self, user_id: &str, endpoint: &str) -> Result<()> {
        sqlx::query("DELETE FROM push_subscription WHERE user_id = ? AND endpoint = ?")
            .bind(user_id)
            .bind(endpoint)
            .execute(&self.write_pool)
            .await?;
        Ok(())
    }
}

/// Transactional subscription reads.
///
/// These run on the caller's connection so fan-out sees the same snapshot as
/// the rest of the enqueue transaction.
pub struct SubscriptionTxOps;

impl SubscriptionTxOps {
    /// Fetch every subscription owned by any of `user_ids` in one query.
    pub async fn list_for_users(
        tx: &mut SqliteConnection,
        user_ids: &[&str],
    ) -> Result<Vec<PushSubscriptionDbModel>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }

        let ids_json = serde_json::to_string(user_ids)?;
        let rows = sqlx::query_as::<_, PushSubscriptionDbModel>(
            r#"
            SELECT * FROM push_subscription
            WHERE user_id IN (SELECT value FROM json_each(?))
            ORDER BY created_at, id
            "#,
        )
        .bind(ids_json)
        .fetch_all(tx)
        .await?;
        Ok(rows)
    }
}
