use serde::{Deserialize, Serialize};

use crate::shared::{BackupConfig, MaintenanceConfig, ValidationError};

/// Top-level configuration of a steward node.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct NodeConfig {
    /// Cluster-unique identifier of this node.
    pub node_id: String,
    /// Maintenance timing configuration.
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    /// Backup artifact configuration.
    pub backup: BackupConfig,
}

impl NodeConfig {
    /// Validates the node configuration and every nested section.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.node_id.trim().is_empty() {
            return Err(ValidationError::EmptyNodeId);
        }

        self.maintenance.validate()?;
        self.backup.validate()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_empty_node_id() {
        let config = NodeConfig {
            node_id: "  ".to_string(),
            maintenance: MaintenanceConfig::default(),
            backup: BackupConfig::new("/tmp"),
        };
        assert_eq!(config.validate(), Err(ValidationError::EmptyNodeId));
    }
}
