mod backup_restore_test;
mod cluster_maintenance_test;
mod repository_test;
