use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cluster::message::{ClusterRequest, ClusterResponse};
use crate::error::StewardResult;

/// Identifier of a cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Replicated key-value store shared by every node of the cluster.
///
/// Values are opaque bytes. Implementations must make the conditional operations atomic across
/// the whole cluster, since they are the only synchronization primitive nodes share.
pub trait ClusterStore {
    /// Returns the value stored under `key`.
    fn get(&self, key: &str) -> impl Future<Output = StewardResult<Option<Vec<u8>>>> + Send;

    /// Stores `value` under `key` unless the key already holds a value.
    ///
    /// Returns `None` when the value was stored and the current value otherwise.
    fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
    ) -> impl Future<Output = StewardResult<Option<Vec<u8>>>> + Send;

    /// Removes `key` only when it currently holds `expected`.
    ///
    /// Returns whether the key was removed.
    fn remove_if(
        &self,
        key: &str,
        expected: &[u8],
    ) -> impl Future<Output = StewardResult<bool>> + Send;
}

/// Serves requests addressed to the local node.
#[async_trait]
pub trait ClusterRequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: ClusterRequest) -> ClusterResponse;
}

/// Request/response messaging between cluster nodes.
pub trait ClusterMessaging {
    /// Returns the id of the local node.
    fn local_node(&self) -> &NodeId;

    /// Registers the handler answering requests sent to the local node.
    fn register_handler(&self, handler: Arc<dyn ClusterRequestHandler>);

    /// Executes `request` on `node` and returns its response.
    ///
    /// Fails with [`crate::error::ErrorKind::ClusterNodeUnavailable`] when the node left the
    /// cluster or serves no handler.
    fn execute_on_node(
        &self,
        node: &NodeId,
        request: ClusterRequest,
    ) -> impl Future<Output = StewardResult<ClusterResponse>> + Send;
}

/// Everything a node needs from the cluster.
pub trait Cluster: ClusterStore + ClusterMessaging + Clone + Send + Sync + 'static {}

impl<T> Cluster for T where T: ClusterStore + ClusterMessaging + Clone + Send + Sync + 'static {}
