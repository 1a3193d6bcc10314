//! Durable push notification delivery queue.
//!
//! Producers enqueue notifications for users; the queue fans them out to one
//! delivery row per device subscription. Any number of [`worker::DequeueWorker`]
//! instances lease batches of deliveries, push them through a
//! [`delivery::DeliveryClient`] and report outcomes back. Expired leases make
//! rows claimable again, so a crashed worker needs no recovery step.

pub mod config;
pub mod database;
pub mod delivery;
pub mod error;
pub mod logging;
pub mod queue;
pub mod worker;

pub use error::{Error, Result};
