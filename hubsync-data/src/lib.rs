//! Remote sources and scheduling for hubsync.
//!
//! Responsibilities:
//! - Implement [`hubsync_core::CoreClient`] and [`hubsync_core::BlobStorage`]
//!   over HTTP.
//! - Drive registered sync managers on per-table intervals.
//!
//! Boundaries:
//! - Sync semantics (cursors, checkpoints, retries) live in `hubsync-core`.
//! - Blocking sync runs stay off async executors; the scheduler hands them to
//!   the blocking pool.
#![forbid(unsafe_code)]

pub mod http;
pub mod schedule;
