//! Notification payloads accepted at enqueue time.

use serde::{Deserialize, Serialize};

/// Anything a producer can turn into a push notification.
///
/// Formatting a domain event (friend request, comment, ...) into this shape
/// happens entirely on the producer side; the queue never looks at the kind.
pub trait NotificationContent {
    fn title(&self) -> String;
    fn body(&self) -> String;

    fn metadata(&self) -> String {
        "{}".to_string()
    }

    fn navigate_target(&self) -> Option<String> {
        None
    }
}

/// Flat payload persisted on the `notification` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    /// Opaque to the queue.
    #[serde(default = "default_metadata")]
    pub metadata: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub navigate: Option<String>,
}

fn default_metadata() -> String {
    "{}".to_string()
}

impl NotificationPayload {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            metadata: default_metadata(),
            navigate: None,
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = metadata.into();
        self
    }

    pub fn with_navigate(mut self, navigate: impl Into<String>) -> Self {
        self.navigate = Some(navigate.into());
        self
    }

    pub fn from_content<C: NotificationContent + ?Sized>(content: &C) -> Self {
        Self {
            title: content.title(),
            body: content.body(),
            metadata: content.metadata(),
            navigate: content.navigate_target(),
        }
    }
}
