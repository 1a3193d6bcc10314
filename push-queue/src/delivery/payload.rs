//! Outbound push message.
//!
//! Wire shape: `{"notification":{"title","body","data":{"url"},"app_badge"}}`.

use serde::{Deserialize, Serialize};

use crate::database::models::NotificationDbModel;

/// Hard cap on the serialized message, below the 4096-byte record size
/// minus encryption overhead.
pub const MAX_PAYLOAD_BYTES: usize = 3500;

const MAX_TITLE_CHARS: usize = 120;
const MAX_BODY_CHARS: usize = 600;
const FALLBACK_TITLE_CHARS: usize = 80;
const FALLBACK_BODY: &str = "Open the app to view details.";
const DEFAULT_URL: &str = "/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMessage {
    pub notification: PushNotification,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushNotification {
    pub title: String,
    pub body: String,
    pub data: PushData,
    pub app_badge: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushData {
    pub url: String,
}

impl PushMessage {
    pub fn from_notification(notification: &NotificationDbModel) -> Self {
        Self {
            notification: PushNotification {
                title: notification.title.clone(),
                body: notification.message.clone(),
                data: PushData {
                    url: notification
                        .navigate
                        .clone()
                        .filter(|url| !url.trim().is_empty())
                        .unwrap_or_else(|| DEFAULT_URL.to_string()),
                },
                app_badge: 1,
            },
        }
    }

    /// Serialize, truncating title and body so the result fits `max_bytes`.
    pub fn to_bytes_capped(&self, max_bytes: usize) -> serde_json::Result<Vec<u8>> {
        let mut capped = self.clone();
        capped.notification.title = truncate_string(&capped.notification.title, MAX_TITLE_CHARS);
        capped.notification.body = truncate_string(&capped.notification.body, MAX_BODY_CHARS);

        let bytes = serde_json::to_vec(&capped)?;
        if bytes.len() <= max_bytes {
            return Ok(bytes);
        }

        capped.notification.title =
            truncate_string(&capped.notification.title, FALLBACK_TITLE_CHARS);
        capped.notification.body = FALLBACK_BODY.to_string();
        serde_json::to_vec(&capped)
    }
}

pub(crate) fn truncate_string(input: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    let mut iter = input.chars();
    let mut out: String = iter.by_ref().take(max_chars).collect();
    if iter.next().is_some() {
        out.push('…');
    }
    out
}
