//! Two-tier cache: the commit history and the build window beneath it.

mod build_cache;
mod commit_cache;
mod filter;
mod refresh;
mod snapshot;

pub use commit_cache::{CacheConfig, CacheState, CommitCache};
pub use filter::{BuilderFilter, DEFAULT_SKIP_PATTERNS};
pub use refresh::RefreshTask;
