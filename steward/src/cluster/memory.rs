use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::Mutex;
use tracing::debug;

use crate::cluster::base::{ClusterMessaging, ClusterRequestHandler, ClusterStore, NodeId};
use crate::cluster::message::{ClusterRequest, ClusterResponse};
use crate::error::{ErrorKind, StewardResult};
use crate::steward_error;

#[derive(Default)]
struct Inner {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    handlers: RwLock<HashMap<NodeId, Arc<dyn ClusterRequestHandler>>>,
}

/// In-process cluster shared by several [`MemoryClusterNode`]s.
///
/// Requests are serialized to JSON and back on their way between nodes, so everything that
/// works against this cluster can cross a real network boundary.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    inner: Arc<Inner>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the view of the cluster seen by node `id`.
    pub fn join(&self, id: impl Into<NodeId>) -> MemoryClusterNode {
        MemoryClusterNode {
            id: id.into(),
            cluster: self.clone(),
        }
    }

    /// Removes node `id`, which stops answering requests.
    pub fn leave(&self, id: &NodeId) {
        self.handlers_mut().remove(id);
        debug!(node = %id, "node left the cluster");
    }

    /// Returns the ids of the nodes serving requests.
    pub fn members(&self) -> Vec<NodeId> {
        let handlers = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut members: Vec<NodeId> = handlers.keys().cloned().collect();
        members.sort();

        members
    }

    fn handler(&self, id: &NodeId) -> Option<Arc<dyn ClusterRequestHandler>> {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn handlers_mut(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<NodeId, Arc<dyn ClusterRequestHandler>>> {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for MemoryCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCluster")
            .field("members", &self.members())
            .finish()
    }
}

/// A node of a [`MemoryCluster`].
#[derive(Debug, Clone)]
pub struct MemoryClusterNode {
    id: NodeId,
    cluster: MemoryCluster,
}

impl MemoryClusterNode {
    /// Returns the cluster this node belongs to.
    pub fn cluster(&self) -> &MemoryCluster {
        &self.cluster
    }
}

impl ClusterStore for MemoryClusterNode {
    async fn get(&self, key: &str) -> StewardResult<Option<Vec<u8>>> {
        let entries = self.cluster.inner.entries.lock().await;

        Ok(entries.get(key).cloned())
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> StewardResult<Option<Vec<u8>>> {
        let mut entries = self.cluster.inner.entries.lock().await;

        if let Some(current) = entries.get(key) {
            return Ok(Some(current.clone()));
        }
        entries.insert(key.to_owned(), value);

        Ok(None)
    }

    async fn remove_if(&self, key: &str, expected: &[u8]) -> StewardResult<bool> {
        let mut entries = self.cluster.inner.entries.lock().await;

        if entries.get(key).is_some_and(|current| current == expected) {
            entries.remove(key);
            return Ok(true);
        }

        Ok(false)
    }
}

impl ClusterMessaging for MemoryClusterNode {
    fn local_node(&self) -> &NodeId {
        &self.id
    }

    fn register_handler(&self, handler: Arc<dyn ClusterRequestHandler>) {
        self.cluster.handlers_mut().insert(self.id.clone(), handler);
        debug!(node = %self.id, "node joined the cluster");
    }

    async fn execute_on_node(
        &self,
        node: &NodeId,
        request: ClusterRequest,
    ) -> StewardResult<ClusterResponse> {
        let handler = self.cluster.handler(node).ok_or_else(|| {
            steward_error!(
                ErrorKind::ClusterNodeUnavailable,
                "The target node is not part of the cluster",
                format!("node `{node}`")
            )
        })?;

        let request: ClusterRequest = serde_json::from_slice(&serde_json::to_vec(&request)?)?;
        debug!(from = %self.id, to = %node, ?request, "executing request on node");
        let response = handler.handle(request).await;

        Ok(serde_json::from_slice(&serde_json::to_vec(&response)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use crate::maintenance::MaintenanceType;

    struct EchoHandler;

    #[async_trait]
    impl ClusterRequestHandler for EchoHandler {
        async fn handle(&self, request: ClusterRequest) -> ClusterResponse {
            match request {
                ClusterRequest::Cancel { .. } => ClusterResponse::Ack,
                ClusterRequest::Progress { kind } | ClusterRequest::UpdateClientProgress { kind, .. } => {
                    ClusterResponse::NoActiveMaintenance { kind }
                }
            }
        }
    }

    #[tokio::test]
    async fn put_if_absent_admits_a_single_writer() {
        let cluster = MemoryCluster::new();
        let first = cluster.join("node-1");
        let second = cluster.join("node-2");

        assert_eq!(first.put_if_absent("slot", b"one".to_vec()).await.unwrap(), None);
        assert_eq!(
            second.put_if_absent("slot", b"two".to_vec()).await.unwrap(),
            Some(b"one".to_vec())
        );
        assert_eq!(second.get("slot").await.unwrap(), Some(b"one".to_vec()));
    }

    #[tokio::test]
    async fn remove_if_requires_matching_value() {
        let node = MemoryCluster::new().join("node-1");
        node.put_if_absent("slot", b"one".to_vec()).await.unwrap();

        assert!(!node.remove_if("slot", b"two").await.unwrap());
        assert!(node.remove_if("slot", b"one").await.unwrap());
        assert_eq!(node.get("slot").await.unwrap(), None);
    }

    #[tokio::test]
    async fn requests_reach_registered_nodes_only() {
        let cluster = MemoryCluster::new();
        let caller = cluster.join("node-1");
        let target = cluster.join("node-2");
        target.register_handler(Arc::new(EchoHandler));

        let response = caller
            .execute_on_node(
                &NodeId::from("node-2"),
                ClusterRequest::Progress {
                    kind: MaintenanceType::Backup,
                },
            )
            .await
            .unwrap();
        assert_eq!(
            response,
            ClusterResponse::NoActiveMaintenance {
                kind: MaintenanceType::Backup
            }
        );

        cluster.leave(&NodeId::from("node-2"));
        let err = caller
            .execute_on_node(
                &NodeId::from("node-2"),
                ClusterRequest::Cancel {
                    kind: MaintenanceType::Backup,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClusterNodeUnavailable);
    }
}
