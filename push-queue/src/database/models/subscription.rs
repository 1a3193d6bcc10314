//! Push subscription database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A browser/device push subscription owned by one user.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushSubscriptionDbModel {
    pub id: String,
    pub user_id: String,
    /// Push service URL the encrypted message is POSTed to
    pub endpoint: String,
    /// Client P-256 public key, base64url (uncompressed point)
    pub p256dh: String,
    /// Client auth secret, base64url (16 bytes)
    pub auth: String,
    /// Unix epoch milliseconds
    pub created_at: i64,
}

impl PushSubscriptionDbModel {
    pub fn new(
        user_id: impl Into<String>,
        endpoint: impl Into<String>,
        p256dh: impl Into<String>,
        auth: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            endpoint: endpoint.into(),
            p256dh: p256dh.into(),
            auth: auth.into(),
            created_at: crate::database::time::now_ms(),
        }
    }

    pub fn descriptor(&self) -> SubscriptionDescriptor {
        SubscriptionDescriptor {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            endpoint: self.endpoint.clone(),
            p256dh: self.p256dh.clone(),
            auth: self.auth.clone(),
        }
    }
}

/// What the delivery client needs to reach one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionDescriptor {
    pub id: String,
    pub user_id: String,
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
}
