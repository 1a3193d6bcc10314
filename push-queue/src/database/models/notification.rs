//! Notification database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::queue::NotificationPayload;

/// One logical message addressed to one user.
///
/// Inserted once by enqueue and never updated afterwards.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationDbModel {
    pub id: String,
    /// Recipient; `None` for broadcast-style records
    pub user_id: Option<String>,
    pub title: String,
    pub message: String,
    /// Opaque blob owned by the producer, usually JSON
    pub metadata: String,
    /// Client-side route to open when the notification is clicked
    pub navigate: Option<String>,
    /// Unix epoch milliseconds
    pub created_at: i64,
}

impl NotificationDbModel {
    pub fn new(user_id: Option<String>, payload: &NotificationPayload, created_at: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            title: payload.title.clone(),
            message: payload.body.clone(),
            metadata: payload.metadata.clone(),
            navigate: payload.navigate.clone(),
            created_at,
        }
    }
}
