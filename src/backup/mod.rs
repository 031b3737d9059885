//! Physical backups streamed to object storage

pub mod manifest;
pub mod orchestrator;
pub mod storage;

pub use manifest::{BackupKind, BackupLayout, BackupManifest, BackupStatus, RestoreOutcome};
pub use orchestrator::BackupOrchestrator;
pub use storage::{InMemoryStoreProvider, ObjectStoreProvider, S3StoreProvider};
