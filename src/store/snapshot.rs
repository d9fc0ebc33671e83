//! Snapshot types and the storage trait.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PersistenceError;
use crate::instances::model::{InstanceConfig, InstanceId, InstanceStatus};

/// Persisted part of one instance. Log history and process handles are not
/// persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedInstance {
    pub config: InstanceConfig,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    pub status: InstanceStatus,
}

/// Whole-registry snapshot, keyed by instance id.
pub type Snapshot = BTreeMap<InstanceId, PersistedInstance>;

/// Backend for registry snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Replace the stored snapshot.
    async fn save(&self, snapshot: &Snapshot) -> Result<(), PersistenceError>;

    /// Load the stored snapshot. `Ok(None)` means nothing has been saved yet.
    async fn load(&self) -> Result<Option<Snapshot>, PersistenceError>;
}
