//! Data models for commits, builds and builder statuses.
//!
//! Field names serialize in camelCase for the dashboard frontend.

mod build;
mod commit;
mod range;
mod status;

pub use build::*;
pub use commit::*;
pub use range::*;
pub use status::*;
