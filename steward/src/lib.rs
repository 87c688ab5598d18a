//! Cluster-wide maintenance mode with backup and restore orchestration.
//!
//! At most one maintenance runs across the whole cluster. While it runs, access to the shared
//! datastore is latched and drained, and the work itself is a [`engine::Task`] of weighted
//! phases with aggregated progress and cooperative cancellation. Any node can report on, or
//! cancel, the maintenance regardless of which node runs it.

pub mod backup;
pub mod cluster;
pub mod engine;
pub mod error;
pub mod latch;
mod macros;
pub mod maintenance;
pub mod node;
pub mod relay;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
