//! Persistence layer — snapshots of the instance registry.

pub mod json_file;
pub mod snapshot;

pub use json_file::JsonFileStore;
pub use snapshot::{PersistedInstance, Snapshot, SnapshotStore};
