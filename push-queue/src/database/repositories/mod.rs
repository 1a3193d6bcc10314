//! Repository layer for database access.

pub mod subscription;

pub use subscription::*;
