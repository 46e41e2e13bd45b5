pub mod address;
pub mod config;
pub mod dataset;
pub mod error;
pub mod exec;
pub mod logger;
pub mod migration;
pub mod progress;
pub mod report;
pub mod snapshot;
pub mod transfer;
pub mod virsh;
pub mod workload;
pub mod zfs;

pub use error::ZmigrateError;

pub type Result<T> = std::result::Result<T, ZmigrateError>;

// Convenience re-exports for callers driving a transfer or migration
pub use address::Address;
pub use config::ZmigrateConfig;
pub use exec::{Connector, ExecutionContext, SshConnector};
pub use migration::{MigrationCoordinator, MigrationJob, MigrationPhase, MigrationStatus};
pub use report::{TransferOutcome, TransferPlan, TransferReport};
pub use transfer::TransferEngine;
