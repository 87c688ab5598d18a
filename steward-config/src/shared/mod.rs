//! Shared configuration types for steward nodes.

mod backup;
mod base;
mod maintenance;
mod node;

pub use backup::BackupConfig;
pub use base::ValidationError;
pub use maintenance::MaintenanceConfig;
pub use node::NodeConfig;
