// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The interface the engine consumes from the storage appliance.
//!
//! Every method is a blocking network round trip from the engine's
//! point of view. Lookups express absence as `Ok(None)`; operations
//! that require the resource fail with `ErrorEnum::NotFound`, and
//! operations blocked by a copy-on-write dependency fail with
//! `ErrorEnum::Busy`.

use std::{collections::HashMap, fmt::Debug};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_derive::Serialize;

use crate::znas::ZnasResult;

pub use self::sim::{SimAppliance, SimCounts};

mod sim;

/// ZFS dataset kinds: a mountable filesystem or a block-device volume
/// (zvol).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Filesystem,
    Volume,
}

/// Specification for creating a dataset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatasetSpec {
    pub name: String,
    pub kind: DatasetKind,
    /// Volume size for zvols, quota for filesystems. `None` leaves the
    /// dataset unbounded.
    pub capacity_bytes: Option<u64>,
    pub sparse: bool,
    pub properties: HashMap<String, String>,
}

/// A dataset as reported by the appliance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dataset {
    pub name: String,
    pub kind: DatasetKind,
    pub capacity_bytes: Option<u64>,
    /// Full `dataset@snapshot` path of the clone origin, if this
    /// dataset is a clone that has not been promoted.
    pub origin: Option<String>,
    pub user_properties: HashMap<String, String>,
}

/// A native snapshot as reported by the appliance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub dataset: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub user_properties: HashMap<String, String>,
}

impl SnapshotInfo {
    /// The full `dataset@snapshot` form used by clone and replication
    /// calls.
    pub fn full_name(&self) -> String {
        format!("{}@{}", self.dataset, self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NfsShare {
    pub id: String,
    pub path: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IscsiTarget {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IscsiExtent {
    pub id: String,
    pub name: String,
    /// Block-device path of the backing zvol.
    pub device: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetExtent {
    pub id: String,
    pub target_id: String,
    pub extent_id: String,
    pub lun: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FabricPort {
    pub id: String,
    pub address: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NvmeSubsystem {
    pub id: String,
    pub name: String,
    pub nqn: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NvmeNamespace {
    pub id: String,
    pub subsystem_id: String,
    pub dataset: String,
    pub nsid: u32,
}

/// Handle for a one-time replication job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicationJob {
    pub id: uuid::Uuid,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplicationState {
    Running,
    Done,
    Failed(String),
}

#[async_trait]
pub trait ApplianceClient: Debug + Send + Sync {
    // Datasets.
    async fn create_dataset(&self, spec: &DatasetSpec) -> ZnasResult<Dataset>;
    async fn get_dataset(&self, name: &str) -> ZnasResult<Option<Dataset>>;
    async fn resize_dataset(&self, name: &str, capacity_bytes: u64) -> ZnasResult<Dataset>;
    /// Destroys the dataset and its snapshots. Fails `Busy` while any
    /// snapshot of the dataset has a dependent clone.
    async fn destroy_dataset(&self, name: &str) -> ZnasResult<()>;

    // Key/value user properties, the engine's durable record.
    async fn set_properties(
        &self,
        dataset: &str,
        properties: &HashMap<String, String>,
    ) -> ZnasResult<()>;
    async fn clear_properties(&self, dataset: &str, keys: &[&str]) -> ZnasResult<()>;
    async fn find_datasets_by_property(&self, key: &str, value: &str)
        -> ZnasResult<Vec<Dataset>>;

    // Snapshots and clones.
    async fn create_snapshot(&self, dataset: &str, name: &str) -> ZnasResult<SnapshotInfo>;
    async fn get_snapshot(&self, dataset: &str, name: &str) -> ZnasResult<Option<SnapshotInfo>>;
    /// All snapshots of the given dataset, or of every dataset when
    /// `None`.
    async fn list_snapshots(&self, dataset: Option<&str>) -> ZnasResult<Vec<SnapshotInfo>>;
    /// Fails `Busy` while a dependent clone of this snapshot exists.
    async fn destroy_snapshot(&self, dataset: &str, name: &str) -> ZnasResult<()>;
    async fn set_snapshot_properties(
        &self,
        dataset: &str,
        name: &str,
        properties: &HashMap<String, String>,
    ) -> ZnasResult<()>;
    async fn clone_snapshot(&self, dataset: &str, name: &str, target: &str)
        -> ZnasResult<Dataset>;
    /// Reverses a clone's dependency on its origin. Fails `Invalid` if
    /// the dataset is not a clone.
    async fn promote_dataset(&self, name: &str) -> ZnasResult<()>;

    // One-time replication.
    async fn start_replication(
        &self,
        source_snapshot: &str,
        target_dataset: &str,
    ) -> ZnasResult<ReplicationJob>;
    async fn replication_state(&self, job: &ReplicationJob) -> ZnasResult<ReplicationState>;

    // NFS exposure.
    async fn create_nfs_share(&self, path: &str) -> ZnasResult<NfsShare>;
    async fn find_nfs_share(&self, path: &str) -> ZnasResult<Option<NfsShare>>;
    async fn delete_nfs_share(&self, id: &str) -> ZnasResult<()>;

    // iSCSI exposure.
    async fn create_target(&self, name: &str) -> ZnasResult<IscsiTarget>;
    async fn find_target(&self, name: &str) -> ZnasResult<Option<IscsiTarget>>;
    async fn delete_target(&self, id: &str) -> ZnasResult<()>;
    async fn create_extent(&self, name: &str, device: &str) -> ZnasResult<IscsiExtent>;
    async fn find_extent(&self, name: &str) -> ZnasResult<Option<IscsiExtent>>;
    async fn delete_extent(&self, id: &str) -> ZnasResult<()>;
    async fn bind_target_extent(
        &self,
        target_id: &str,
        extent_id: &str,
        lun: u32,
    ) -> ZnasResult<TargetExtent>;
    async fn find_target_extent(
        &self,
        target_id: &str,
        extent_id: &str,
    ) -> ZnasResult<Option<TargetExtent>>;
    async fn delete_target_extent(&self, id: &str) -> ZnasResult<()>;

    // NVMe-oF exposure.
    async fn list_fabric_ports(&self) -> ZnasResult<Vec<FabricPort>>;
    async fn create_subsystem(&self, name: &str, nqn: &str) -> ZnasResult<NvmeSubsystem>;
    async fn find_subsystem(&self, name: &str) -> ZnasResult<Option<NvmeSubsystem>>;
    async fn delete_subsystem(&self, id: &str) -> ZnasResult<()>;
    async fn create_namespace(&self, subsystem_id: &str, dataset: &str)
        -> ZnasResult<NvmeNamespace>;
    async fn find_namespace(
        &self,
        subsystem_id: &str,
        dataset: &str,
    ) -> ZnasResult<Option<NvmeNamespace>>;
    async fn delete_namespace(&self, id: &str) -> ZnasResult<()>;
}
