//! Backup root capacity and retention.

pub mod monitor;
pub mod retention;

pub use monitor::{AlertLevel, CapacityModel, DiskUsageSample, StorageMonitor};
pub use retention::{CleanupReport, RetentionManager};
