//! Database models.
//!
//! Row types mapped with `sqlx::FromRow`. Status values are stored as
//! lowercase text and parsed into their enum counterparts at the edges.

pub mod delivery;
pub mod notification;
pub mod subscription;

pub use delivery::*;
pub use notification::*;
pub use subscription::*;
