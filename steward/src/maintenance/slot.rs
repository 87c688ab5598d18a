use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cluster::NodeId;
use crate::engine::TaskId;

/// Kind of disruptive operation holding the maintenance slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceType {
    Backup,
    Restore,
    SchemaMigration,
}

impl MaintenanceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaintenanceType::Backup => "backup",
            MaintenanceType::Restore => "restore",
            MaintenanceType::SchemaMigration => "schema_migration",
        }
    }
}

impl fmt::Display for MaintenanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cluster-wide record of the running maintenance operation.
///
/// Exists from admission until the task reached a terminal state and cleaned up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceSlot {
    pub kind: MaintenanceType,
    pub owner: NodeId,
    pub started_at: DateTime<Utc>,
    pub monitor_id: TaskId,
}
