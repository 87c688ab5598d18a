//! Cluster collaborators: a replicated key-value store and node-to-node messaging.

pub mod base;
pub mod memory;
pub mod message;

pub use base::{Cluster, ClusterMessaging, ClusterRequestHandler, ClusterStore, NodeId};
pub use memory::{MemoryCluster, MemoryClusterNode};
pub use message::{ClusterRequest, ClusterResponse};
