//! Shared domain types for reelsmith servers and clients.
//!
//! Everything that crosses the wire (polling responses, push events) or
//! must be computed identically on both sides of it (the stall policy)
//! lives here, so the job gateway and the `watch` client cannot drift.

pub mod events;
pub mod failure;
pub mod job;
pub mod stall;

pub use events::PushEvent;
pub use failure::{ErrorCode, JobFailure};
pub use job::{Job, JobId, JobStatus, JobView, Stage};
pub use stall::{StallTracker, is_stuck, stall_threshold};
