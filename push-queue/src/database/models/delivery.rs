//! Delivery database models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{NotificationDbModel, SubscriptionDescriptor};
use crate::database::time::ms_to_datetime;

/// Delivery status values.
///
/// `pending -> processing -> sent | pending | failed`. A `processing` row
/// whose lease has expired is claimable again, exactly like `pending`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Waiting to be claimed by a worker.
    Pending,
    /// Leased by a worker until `locked_until`.
    Processing,
    /// Accepted by the push service.
    Sent,
    /// Retries exhausted or endpoint gone.
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }
}

/// One attempt record for a (notification, subscription) pair.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryDbModel {
    pub id: String,
    pub notification_id: String,
    /// `None` once the subscription row has been deleted
    pub subscription_id: Option<String>,
    /// Endpoint snapshot taken at enqueue time
    pub endpoint: String,
    pub status: String,
    pub retries: i64,
    pub created_at: i64,
    pub locked_by: Option<String>,
    pub locked_until: Option<i64>,
}

impl DeliveryDbModel {
    pub fn new_pending(
        notification_id: impl Into<String>,
        subscription_id: impl Into<String>,
        endpoint: impl Into<String>,
        created_at: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            notification_id: notification_id.into(),
            subscription_id: Some(subscription_id.into()),
            endpoint: endpoint.into(),
            status: DeliveryStatus::Pending.as_str().to_string(),
            retries: 0,
            created_at,
            locked_by: None,
            locked_until: None,
        }
    }

    pub fn status(&self) -> Option<DeliveryStatus> {
        DeliveryStatus::parse(&self.status)
    }

    pub fn lease_expires_at(&self) -> Option<DateTime<Utc>> {
        self.locked_until.map(ms_to_datetime)
    }
}

/// Flat row returned by the claim join.
#[derive(Debug, Clone, FromRow)]
pub struct ClaimedDeliveryRow {
    pub delivery_id: String,
    pub notification_id: String,
    pub subscription_id: Option<String>,
    pub endpoint: String,
    pub status: String,
    pub retries: i64,
    pub delivery_created_at: i64,
    pub locked_by: Option<String>,
    pub locked_until: Option<i64>,
    pub user_id: Option<String>,
    pub title: String,
    pub message: String,
    pub metadata: String,
    pub navigate: Option<String>,
    pub notification_created_at: i64,
    pub subscription_user_id: Option<String>,
    pub p256dh: Option<String>,
    pub auth: Option<String>,
}

/// A leased delivery joined with its notification and current subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedDelivery {
    pub delivery: DeliveryDbModel,
    pub notification: NotificationDbModel,
    /// `None` when the subscription was removed after enqueue
    pub subscription: Option<SubscriptionDescriptor>,
}

impl From<ClaimedDeliveryRow> for ClaimedDelivery {
    fn from(row: ClaimedDeliveryRow) -> Self {
        let subscription = match (
            row.subscription_id.clone(),
            row.subscription_user_id,
            row.p256dh,
            row.auth,
        ) {
            (Some(id), Some(user_id), Some(p256dh), Some(auth)) => Some(SubscriptionDescriptor {
                id,
                user_id,
                endpoint: row.endpoint.clone(),
                p256dh,
                auth,
            }),
            _ => None,
        };

        Self {
            delivery: DeliveryDbModel {
                id: row.delivery_id,
                notification_id: row.notification_id.clone(),
                subscription_id: row.subscription_id,
                endpoint: row.endpoint,
                status: row.status,
                retries: row.retries,
                created_at: row.delivery_created_at,
                locked_by: row.locked_by,
                locked_until: row.locked_until,
            },
            notification: NotificationDbModel {
                id: row.notification_id,
                user_id: row.user_id,
                title: row.title,
                message: row.message,
                metadata: row.metadata,
                navigate: row.navigate,
                created_at: row.notification_created_at,
            },
            subscription,
        }
    }
}

/// Delivery counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub sent: u64,
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_status() {
        assert_eq!(DeliveryStatus::Processing.as_str(), "processing");
        assert_eq!(DeliveryStatus::parse("sent"), Some(DeliveryStatus::Sent));
        assert_eq!(DeliveryStatus::parse("SENT"), None);
        assert_eq!(DeliveryStatus::Failed.to_string(), "failed");
        assert!(DeliveryStatus::Sent.is_terminal());
        assert!(!DeliveryStatus::Processing.is_terminal());
    }

    fn row(subscription_id: Option<&str>, p256dh: Option<&str>) -> ClaimedDeliveryRow {
        ClaimedDeliveryRow {
            delivery_id: "d1".to_string(),
            notification_id: "n1".to_string(),
            subscription_id: subscription_id.map(str::to_string),
            endpoint: "https://push.example.com/abc".to_string(),
            status: "processing".to_string(),
            retries: 1,
            delivery_created_at: 10,
            locked_by: Some("worker-a".to_string()),
            locked_until: Some(60_010),
            user_id: Some("u1".to_string()),
            title: "Hi".to_string(),
            message: "There".to_string(),
            metadata: "{}".to_string(),
            navigate: None,
            notification_created_at: 10,
            subscription_user_id: subscription_id.map(|_| "u1".to_string()),
            p256dh: p256dh.map(str::to_string),
            auth: p256dh.map(|_| "auth".to_string()),
        }
    }

    #[test]
    fn test_claimed_row_with_subscription() {
        let claimed = ClaimedDelivery::from(row(Some("s1"), Some("key")));
        let sub = claimed.subscription.unwrap();
        assert_eq!(sub.id, "s1");
        assert_eq!(sub.endpoint, "https://push.example.com/abc");
        assert_eq!(claimed.delivery.status(), Some(DeliveryStatus::Processing));
        assert_eq!(
            claimed.delivery.lease_expires_at().map(|t| t.timestamp_millis()),
            Some(60_010)
        );
    }

    #[test]
    fn test_claimed_row_without_subscription() {
        let claimed = ClaimedDelivery::from(row(None, None));
        assert!(claimed.subscription.is_none());
        assert_eq!(claimed.notification.title, "Hi");
    }
}
