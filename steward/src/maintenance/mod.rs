//! Cluster-wide admission of maintenance operations.
//!
//! At most one maintenance task runs across the whole cluster. Admission is a compare-and-set
//! on a single key of the [`crate::cluster::ClusterStore`], so nodes never rely on local memory
//! to decide whether they may start.

pub mod coordinator;
pub mod monitor;
pub mod slot;

pub use coordinator::{MAINTENANCE_SLOT_KEY, MaintenanceCoordinator, WeakCoordinator};
pub use monitor::{MonitorSnapshot, TaskMonitor};
pub use slot::{MaintenanceSlot, MaintenanceType};
