//! Access-grant projection for classync.
//!
//! Third-party clients and API keys read schedules through grants issued by
//! their owners. Grants are kept by the authorization system; this crate
//! only joins them against stored schedules and events.

mod error;
mod projection;

pub use error::AccessError;
pub use projection::{AccessProjection, VisibleSchedule};
