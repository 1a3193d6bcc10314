//! Durable notification queue.
//!
//! Producers enqueue a [`NotificationPayload`] for one or many users; the
//! queue fans it out into one delivery row per device subscription. Workers
//! claim batches of deliveries under a time-bounded lease and report each
//! outcome back. A lease that runs out without an outcome makes the row
//! claimable again, which is the only crash recovery there is.

pub mod payload;
pub mod service;
pub mod tx;

pub use payload::{NotificationContent, NotificationPayload};
pub use service::{NotificationQueue, SqlxNotificationQueue};
pub use tx::NotificationQueueTxOps;
