//! Delivery client boundary.
//!
//! A [`DeliveryClient`] pushes one [`PushMessage`] to one device and
//! classifies the push service's answer. The worker decides what each
//! classification means for the queue.

pub mod payload;
pub mod web_push;

pub use payload::PushMessage;
pub use web_push::{WebPushClient, WebPushConfig};

use async_trait::async_trait;
use thiserror::Error;

use crate::database::models::SubscriptionDescriptor;

/// Why a send did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Worth retrying later: network trouble, throttling, 5xx, unexpected 4xx.
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// The push service no longer knows this endpoint.
    #[error("subscription gone (status {status})")]
    Gone { status: u16 },

    /// Endpoint or keys can never be delivered to.
    #[error("invalid subscription: {0}")]
    InvalidSubscription(String),
}

impl DeliveryError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Gone { .. } | Self::InvalidSubscription(_))
    }
}

/// Sends push messages to device subscriptions.
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    async fn send(
        &self,
        subscription: &SubscriptionDescriptor,
        message: &PushMessage,
    ) -> std::result::Result<(), DeliveryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_classification() {
        assert!(DeliveryError::Gone { status: 410 }.is_permanent());
        assert!(DeliveryError::InvalidSubscription("bad p256dh".into()).is_permanent());
        assert!(!DeliveryError::transient("503").is_permanent());
        assert_eq!(
            DeliveryError::Gone { status: 404 }.to_string(),
            "subscription gone (status 404)"
        );
    }
}
