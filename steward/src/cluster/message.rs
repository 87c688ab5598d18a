use serde::{Deserialize, Serialize};

use crate::maintenance::{MaintenanceType, MonitorSnapshot};

/// Request sent from one node to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterRequest {
    /// Records progress reported by a client of the maintenance running on the target node.
    UpdateClientProgress { kind: MaintenanceType, progress: u8 },
    /// Reads the progress of the maintenance running on the target node.
    Progress { kind: MaintenanceType },
    /// Cancels the maintenance running on the target node.
    Cancel { kind: MaintenanceType },
}

/// Response to a [`ClusterRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterResponse {
    Ack,
    Progress { snapshot: MonitorSnapshot },
    /// The target node runs no maintenance of the requested kind.
    NoActiveMaintenance { kind: MaintenanceType },
    Failed { description: String },
}
