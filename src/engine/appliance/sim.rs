// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! An in-memory appliance used by the simulation backend and the test
//! suite. It models the parts of ZFS semantics the engine depends on:
//! clone origins, the dependency rules they impose on destroy, promote
//! reversing a dependency, and replication producing an independent
//! dataset.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use uuid::Uuid;

use crate::{
    engine::appliance::{
        ApplianceClient, Dataset, DatasetKind, DatasetSpec, FabricPort, IscsiExtent, IscsiTarget,
        NfsShare, NvmeNamespace, NvmeSubsystem, ReplicationJob, ReplicationState, SnapshotInfo,
        TargetExtent,
    },
    znas::{ErrorEnum, ZnasError, ZnasResult},
};

#[derive(Debug, Clone)]
struct SimSnapshot {
    name: String,
    created_at: DateTime<Utc>,
    properties: HashMap<String, String>,
}

#[derive(Debug, Clone)]
struct SimDataset {
    name: String,
    kind: DatasetKind,
    capacity_bytes: Option<u64>,
    /// `dataset@snapshot` this dataset is a clone of, until promoted.
    origin: Option<String>,
    snapshots: IndexMap<String, SimSnapshot>,
    properties: HashMap<String, String>,
}

impl SimDataset {
    fn view(&self) -> Dataset {
        Dataset {
            name: self.name.clone(),
            kind: self.kind,
            capacity_bytes: self.capacity_bytes,
            origin: self.origin.clone(),
            user_properties: self.properties.clone(),
        }
    }

    fn snapshot_view(&self, snap: &SimSnapshot) -> SnapshotInfo {
        SnapshotInfo {
            dataset: self.name.clone(),
            name: snap.name.clone(),
            created_at: snap.created_at,
            user_properties: snap.properties.clone(),
        }
    }
}

#[derive(Debug)]
struct SimJob {
    state: ReplicationState,
    remaining_polls: u32,
}

/// Counts of appliance-side objects, for asserting that an operation
/// created or destroyed exactly what it should have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimCounts {
    pub datasets: usize,
    pub snapshots: usize,
    pub nfs_shares: usize,
    pub targets: usize,
    pub extents: usize,
    pub target_extents: usize,
    pub subsystems: usize,
    pub namespaces: usize,
}

#[derive(Debug, Default)]
struct SimState {
    datasets: IndexMap<String, SimDataset>,
    nfs_shares: IndexMap<String, NfsShare>,
    targets: IndexMap<String, IscsiTarget>,
    extents: IndexMap<String, IscsiExtent>,
    target_extents: IndexMap<String, TargetExtent>,
    subsystems: IndexMap<String, NvmeSubsystem>,
    namespaces: IndexMap<String, NvmeNamespace>,
    fabric_ports: Vec<FabricPort>,
    jobs: IndexMap<Uuid, SimJob>,
    fail_points: Vec<&'static str>,
    fail_replication: bool,
    replication_delay: u32,
    creations: u64,
}

impl SimState {
    /// Consume a pending failure injection for the named operation.
    fn check_fail(&mut self, op: &'static str) -> ZnasResult<()> {
        if let Some(pos) = self.fail_points.iter().position(|armed| *armed == op) {
            self.fail_points.remove(pos);
            return Err(ZnasError::Error(format!("injected failure in {op}")));
        }
        Ok(())
    }

    /// Names of datasets that are unpromoted clones of
    /// `dataset@snapshot`.
    fn clone_dependents(&self, dataset: &str, snapshot: &str) -> Vec<String> {
        let origin = format!("{dataset}@{snapshot}");
        self.datasets
            .values()
            .filter(|ds| ds.origin.as_deref() == Some(origin.as_str()))
            .map(|ds| ds.name.clone())
            .collect()
    }

    fn dataset_mut(&mut self, name: &str) -> ZnasResult<&mut SimDataset> {
        self.datasets.get_mut(name).ok_or_else(|| {
            ZnasError::Engine(ErrorEnum::NotFound, format!("dataset {name} not found"))
        })
    }
}

/// An in-memory stand-in for the storage appliance.
#[derive(Debug, Default)]
pub struct SimAppliance {
    state: Mutex<SimState>,
}

impl SimAppliance {
    pub fn new() -> SimAppliance {
        SimAppliance::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().expect("sim state mutex poisoned")
    }

    /// Configure an NVMe-oF port. The simulated appliance starts with
    /// none, so fabric provisioning fails its precondition check until
    /// one is added.
    pub fn add_fabric_port(&self, address: &str) {
        let mut state = self.lock();
        let id = Uuid::new_v4().to_string();
        state.fabric_ports.push(FabricPort {
            id,
            address: address.to_string(),
        });
    }

    /// Arm a one-shot failure for the named client operation, e.g.
    /// `"create_extent"`. The next call to that operation fails; later
    /// calls succeed.
    pub fn fail_next(&self, op: &'static str) {
        self.lock().fail_points.push(op);
    }

    /// Make subsequently started replication jobs finish in the failed
    /// state, leaving a partial target dataset behind.
    pub fn fail_replication(&self, enabled: bool) {
        self.lock().fail_replication = enabled;
    }

    /// Number of status polls a replication job reports `Running`
    /// before reaching its terminal state.
    pub fn set_replication_delay(&self, polls: u32) {
        self.lock().replication_delay = polls;
    }

    /// Total number of successful appliance-side object creations.
    pub fn creation_count(&self) -> u64 {
        self.lock().creations
    }

    pub fn dataset_names(&self) -> Vec<String> {
        self.lock().datasets.keys().cloned().collect()
    }

    pub fn dataset_property(&self, dataset: &str, key: &str) -> Option<String> {
        self.lock()
            .datasets
            .get(dataset)
            .and_then(|ds| ds.properties.get(key).cloned())
    }

    pub fn counts(&self) -> SimCounts {
        let state = self.lock();
        SimCounts {
            datasets: state.datasets.len(),
            snapshots: state.datasets.values().map(|ds| ds.snapshots.len()).sum(),
            nfs_shares: state.nfs_shares.len(),
            targets: state.targets.len(),
            extents: state.extents.len(),
            target_extents: state.target_extents.len(),
            subsystems: state.subsystems.len(),
            namespaces: state.namespaces.len(),
        }
    }
}

#[async_trait]
impl ApplianceClient for SimAppliance {
    async fn create_dataset(&self, spec: &DatasetSpec) -> ZnasResult<Dataset> {
        let mut state = self.lock();
        state.check_fail("create_dataset")?;
        if state.datasets.contains_key(&spec.name) {
            return Err(ZnasError::Engine(
                ErrorEnum::AlreadyExists,
                format!("dataset {} already exists", spec.name),
            ));
        }
        let ds = SimDataset {
            name: spec.name.clone(),
            kind: spec.kind,
            capacity_bytes: spec.capacity_bytes,
            origin: None,
            snapshots: IndexMap::new(),
            properties: spec.properties.clone(),
        };
        let view = ds.view();
        state.datasets.insert(spec.name.clone(), ds);
        state.creations += 1;
        Ok(view)
    }

    async fn get_dataset(&self, name: &str) -> ZnasResult<Option<Dataset>> {
        Ok(self.lock().datasets.get(name).map(|ds| ds.view()))
    }

    async fn resize_dataset(&self, name: &str, capacity_bytes: u64) -> ZnasResult<Dataset> {
        let mut state = self.lock();
        state.check_fail("resize_dataset")?;
        let ds = state.dataset_mut(name)?;
        ds.capacity_bytes = Some(capacity_bytes);
        Ok(ds.view())
    }

    async fn destroy_dataset(&self, name: &str) -> ZnasResult<()> {
        let mut state = self.lock();
        state.check_fail("destroy_dataset")?;
        let snapshots: Vec<String> = match state.datasets.get(name) {
            Some(ds) => ds.snapshots.keys().cloned().collect(),
            None => {
                return Err(ZnasError::Engine(
                    ErrorEnum::NotFound,
                    format!("dataset {name} not found"),
                ))
            }
        };
        for snap in &snapshots {
            let dependents = state.clone_dependents(name, snap);
            if !dependents.is_empty() {
                return Err(ZnasError::Engine(
                    ErrorEnum::Busy,
                    format!(
                        "snapshot {name}@{snap} has dependent clones: {}",
                        dependents.join(", ")
                    ),
                ));
            }
        }
        state.datasets.shift_remove(name);
        Ok(())
    }

    async fn set_properties(
        &self,
        dataset: &str,
        properties: &HashMap<String, String>,
    ) -> ZnasResult<()> {
        let mut state = self.lock();
        state.check_fail("set_properties")?;
        let ds = state.dataset_mut(dataset)?;
        ds.properties
            .extend(properties.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn clear_properties(&self, dataset: &str, keys: &[&str]) -> ZnasResult<()> {
        let mut state = self.lock();
        state.check_fail("clear_properties")?;
        let ds = state.dataset_mut(dataset)?;
        for key in keys {
            ds.properties.remove(*key);
        }
        Ok(())
    }

    async fn find_datasets_by_property(
        &self,
        key: &str,
        value: &str,
    ) -> ZnasResult<Vec<Dataset>> {
        Ok(self
            .lock()
            .datasets
            .values()
            .filter(|ds| ds.properties.get(key).map(|v| v.as_str()) == Some(value))
            .map(|ds| ds.view())
            .collect())
    }

    async fn create_snapshot(&self, dataset: &str, name: &str) -> ZnasResult<SnapshotInfo> {
        let mut state = self.lock();
        state.check_fail("create_snapshot")?;
        let ds = state.dataset_mut(dataset)?;
        if ds.snapshots.contains_key(name) {
            return Err(ZnasError::Engine(
                ErrorEnum::AlreadyExists,
                format!("snapshot {dataset}@{name} already exists"),
            ));
        }
        let snap = SimSnapshot {
            name: name.to_string(),
            created_at: Utc::now(),
            properties: HashMap::new(),
        };
        let view = ds.snapshot_view(&snap);
        ds.snapshots.insert(name.to_string(), snap);
        state.creations += 1;
        Ok(view)
    }

    async fn get_snapshot(&self, dataset: &str, name: &str) -> ZnasResult<Option<SnapshotInfo>> {
        Ok(self
            .lock()
            .datasets
            .get(dataset)
            .and_then(|ds| ds.snapshots.get(name).map(|snap| ds.snapshot_view(snap))))
    }

    async fn list_snapshots(&self, dataset: Option<&str>) -> ZnasResult<Vec<SnapshotInfo>> {
        let state = self.lock();
        let mut snapshots = Vec::new();
        for ds in state.datasets.values() {
            if dataset.is_some_and(|name| name != ds.name) {
                continue;
            }
            snapshots.extend(ds.snapshots.values().map(|snap| ds.snapshot_view(snap)));
        }
        Ok(snapshots)
    }

    async fn destroy_snapshot(&self, dataset: &str, name: &str) -> ZnasResult<()> {
        let mut state = self.lock();
        state.check_fail("destroy_snapshot")?;
        if !state
            .datasets
            .get(dataset)
            .is_some_and(|ds| ds.snapshots.contains_key(name))
        {
            return Err(ZnasError::Engine(
                ErrorEnum::NotFound,
                format!("snapshot {dataset}@{name} not found"),
            ));
        }
        let dependents = state.clone_dependents(dataset, name);
        if !dependents.is_empty() {
            return Err(ZnasError::Engine(
                ErrorEnum::Busy,
                format!(
                    "snapshot {dataset}@{name} has dependent clones: {}",
                    dependents.join(", ")
                ),
            ));
        }
        state
            .dataset_mut(dataset)
            .expect("existence checked above")
            .snapshots
            .shift_remove(name);
        Ok(())
    }

    async fn set_snapshot_properties(
        &self,
        dataset: &str,
        name: &str,
        properties: &HashMap<String, String>,
    ) -> ZnasResult<()> {
        let mut state = self.lock();
        state.check_fail("set_snapshot_properties")?;
        let ds = state.dataset_mut(dataset)?;
        let snap = ds.snapshots.get_mut(name).ok_or_else(|| {
            ZnasError::Engine(
                ErrorEnum::NotFound,
                format!("snapshot {dataset}@{name} not found"),
            )
        })?;
        snap.properties
            .extend(properties.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn clone_snapshot(
        &self,
        dataset: &str,
        name: &str,
        target: &str,
    ) -> ZnasResult<Dataset> {
        let mut state = self.lock();
        state.check_fail("clone_snapshot")?;
        let (kind, capacity_bytes) = match state
            .datasets
            .get(dataset)
            .filter(|ds| ds.snapshots.contains_key(name))
        {
            Some(ds) => (ds.kind, ds.capacity_bytes),
            None => {
                return Err(ZnasError::Engine(
                    ErrorEnum::NotFound,
                    format!("snapshot {dataset}@{name} not found"),
                ))
            }
        };
        if state.datasets.contains_key(target) {
            return Err(ZnasError::Engine(
                ErrorEnum::AlreadyExists,
                format!("dataset {target} already exists"),
            ));
        }
        let ds = SimDataset {
            name: target.to_string(),
            kind,
            capacity_bytes,
            origin: Some(format!("{dataset}@{name}")),
            snapshots: IndexMap::new(),
            properties: HashMap::new(),
        };
        let view = ds.view();
        state.datasets.insert(target.to_string(), ds);
        state.creations += 1;
        Ok(view)
    }

    async fn promote_dataset(&self, name: &str) -> ZnasResult<()> {
        let mut state = self.lock();
        state.check_fail("promote_dataset")?;
        let origin = match state.datasets.get(name) {
            Some(ds) => ds.origin.clone(),
            None => {
                return Err(ZnasError::Engine(
                    ErrorEnum::NotFound,
                    format!("dataset {name} not found"),
                ))
            }
        };
        let origin = origin.ok_or_else(|| {
            ZnasError::Engine(
                ErrorEnum::Invalid,
                format!("dataset {name} is not a clone"),
            )
        })?;
        let (parent, snap_name) = origin
            .split_once('@')
            .map(|(d, s)| (d.to_string(), s.to_string()))
            .ok_or_else(|| ZnasError::Error(format!("malformed clone origin {origin}")))?;
        // The origin snapshot migrates from the former parent to the
        // promoted clone; the parent becomes the dependent side.
        let snap = state
            .dataset_mut(&parent)?
            .snapshots
            .shift_remove(&snap_name)
            .ok_or_else(|| {
                ZnasError::Error(format!("clone origin {origin} has no backing snapshot"))
            })?;
        state.dataset_mut(&parent)?.origin = Some(format!("{name}@{snap_name}"));
        let clone = state.dataset_mut(name)?;
        clone.snapshots.insert(snap_name, snap);
        clone.origin = None;
        Ok(())
    }

    async fn start_replication(
        &self,
        source_snapshot: &str,
        target_dataset: &str,
    ) -> ZnasResult<ReplicationJob> {
        let mut state = self.lock();
        state.check_fail("start_replication")?;
        let (src_ds, src_snap) = source_snapshot.split_once('@').ok_or_else(|| {
            ZnasError::Engine(
                ErrorEnum::Invalid,
                format!("{source_snapshot} is not a snapshot path"),
            )
        })?;
        let (kind, capacity_bytes, snap) = match state
            .datasets
            .get(src_ds)
            .and_then(|ds| ds.snapshots.get(src_snap).map(|s| (ds.kind, ds.capacity_bytes, s.clone())))
        {
            Some(found) => found,
            None => {
                return Err(ZnasError::Engine(
                    ErrorEnum::NotFound,
                    format!("snapshot {source_snapshot} not found"),
                ))
            }
        };
        if state.datasets.contains_key(target_dataset) {
            return Err(ZnasError::Engine(
                ErrorEnum::AlreadyExists,
                format!("dataset {target_dataset} already exists"),
            ));
        }
        let failed = state.fail_replication;
        // A received dataset is independent of its source and carries
        // the replicated snapshot. A failed job leaves a partial
        // dataset with no snapshot, as an interrupted receive would.
        let mut snapshots = IndexMap::new();
        if !failed {
            snapshots.insert(snap.name.clone(), snap);
        }
        state.datasets.insert(
            target_dataset.to_string(),
            SimDataset {
                name: target_dataset.to_string(),
                kind,
                capacity_bytes,
                origin: None,
                snapshots,
                properties: HashMap::new(),
            },
        );
        state.creations += 1;
        let job = ReplicationJob { id: Uuid::new_v4() };
        let sim_job = SimJob {
            state: if failed {
                ReplicationState::Failed("replication interrupted".to_string())
            } else {
                ReplicationState::Done
            },
            remaining_polls: state.replication_delay,
        };
        state.jobs.insert(job.id, sim_job);
        Ok(job)
    }

    async fn replication_state(&self, job: &ReplicationJob) -> ZnasResult<ReplicationState> {
        let mut state = self.lock();
        let sim_job = state.jobs.get_mut(&job.id).ok_or_else(|| {
            ZnasError::Engine(
                ErrorEnum::NotFound,
                format!("replication job {} not found", job.id),
            )
        })?;
        if sim_job.remaining_polls > 0 {
            sim_job.remaining_polls -= 1;
            return Ok(ReplicationState::Running);
        }
        Ok(sim_job.state.clone())
    }

    async fn create_nfs_share(&self, path: &str) -> ZnasResult<NfsShare> {
        let mut state = self.lock();
        state.check_fail("create_nfs_share")?;
        if state.nfs_shares.values().any(|share| share.path == path) {
            return Err(ZnasError::Engine(
                ErrorEnum::AlreadyExists,
                format!("an NFS share for {path} already exists"),
            ));
        }
        let share = NfsShare {
            id: Uuid::new_v4().to_string(),
            path: path.to_string(),
        };
        state.nfs_shares.insert(share.id.clone(), share.clone());
        state.creations += 1;
        Ok(share)
    }

    async fn find_nfs_share(&self, path: &str) -> ZnasResult<Option<NfsShare>> {
        Ok(self
            .lock()
            .nfs_shares
            .values()
            .find(|share| share.path == path)
            .cloned())
    }

    async fn delete_nfs_share(&self, id: &str) -> ZnasResult<()> {
        let mut state = self.lock();
        state.check_fail("delete_nfs_share")?;
        state.nfs_shares.shift_remove(id).ok_or_else(|| {
            ZnasError::Engine(ErrorEnum::NotFound, format!("NFS share {id} not found"))
        })?;
        Ok(())
    }

    async fn create_target(&self, name: &str) -> ZnasResult<IscsiTarget> {
        let mut state = self.lock();
        state.check_fail("create_target")?;
        if state.targets.values().any(|target| target.name == name) {
            return Err(ZnasError::Engine(
                ErrorEnum::AlreadyExists,
                format!("target {name} already exists"),
            ));
        }
        let target = IscsiTarget {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
        };
        state.targets.insert(target.id.clone(), target.clone());
        state.creations += 1;
        Ok(target)
    }

    async fn find_target(&self, name: &str) -> ZnasResult<Option<IscsiTarget>> {
        Ok(self
            .lock()
            .targets
            .values()
            .find(|target| target.name == name)
            .cloned())
    }

    async fn delete_target(&self, id: &str) -> ZnasResult<()> {
        let mut state = self.lock();
        state.check_fail("delete_target")?;
        state.targets.shift_remove(id).ok_or_else(|| {
            ZnasError::Engine(ErrorEnum::NotFound, format!("target {id} not found"))
        })?;
        Ok(())
    }

    async fn create_extent(&self, name: &str, device: &str) -> ZnasResult<IscsiExtent> {
        let mut state = self.lock();
        state.check_fail("create_extent")?;
        if state.extents.values().any(|extent| extent.name == name) {
            return Err(ZnasError::Engine(
                ErrorEnum::AlreadyExists,
                format!("extent {name} already exists"),
            ));
        }
        let extent = IscsiExtent {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            device: device.to_string(),
        };
        state.extents.insert(extent.id.clone(), extent.clone());
        state.creations += 1;
        Ok(extent)
    }

    async fn find_extent(&self, name: &str) -> ZnasResult<Option<IscsiExtent>> {
        Ok(self
            .lock()
            .extents
            .values()
            .find(|extent| extent.name == name)
            .cloned())
    }

    async fn delete_extent(&self, id: &str) -> ZnasResult<()> {
        let mut state = self.lock();
        state.check_fail("delete_extent")?;
        state.extents.shift_remove(id).ok_or_else(|| {
            ZnasError::Engine(ErrorEnum::NotFound, format!("extent {id} not found"))
        })?;
        Ok(())
    }

    async fn bind_target_extent(
        &self,
        target_id: &str,
        extent_id: &str,
        lun: u32,
    ) -> ZnasResult<TargetExtent> {
        let mut state = self.lock();
        state.check_fail("bind_target_extent")?;
        if !state.targets.contains_key(target_id) {
            return Err(ZnasError::Engine(
                ErrorEnum::NotFound,
                format!("target {target_id} not found"),
            ));
        }
        if !state.extents.contains_key(extent_id) {
            return Err(ZnasError::Engine(
                ErrorEnum::NotFound,
                format!("extent {extent_id} not found"),
            ));
        }
        if state
            .target_extents
            .values()
            .any(|te| te.target_id == target_id && te.extent_id == extent_id)
        {
            return Err(ZnasError::Engine(
                ErrorEnum::AlreadyExists,
                format!("extent {extent_id} is already bound to target {target_id}"),
            ));
        }
        let te = TargetExtent {
            id: Uuid::new_v4().to_string(),
            target_id: target_id.to_string(),
            extent_id: extent_id.to_string(),
            lun,
        };
        state.target_extents.insert(te.id.clone(), te.clone());
        state.creations += 1;
        Ok(te)
    }

    async fn find_target_extent(
        &self,
        target_id: &str,
        extent_id: &str,
    ) -> ZnasResult<Option<TargetExtent>> {
        Ok(self
            .lock()
            .target_extents
            .values()
            .find(|te| te.target_id == target_id && te.extent_id == extent_id)
            .cloned())
    }

    async fn delete_target_extent(&self, id: &str) -> ZnasResult<()> {
        let mut state = self.lock();
        state.check_fail("delete_target_extent")?;
        state.target_extents.shift_remove(id).ok_or_else(|| {
            ZnasError::Engine(
                ErrorEnum::NotFound,
                format!("target-extent binding {id} not found"),
            )
        })?;
        Ok(())
    }

    async fn list_fabric_ports(&self) -> ZnasResult<Vec<FabricPort>> {
        Ok(self.lock().fabric_ports.clone())
    }

    async fn create_subsystem(&self, name: &str, nqn: &str) -> ZnasResult<NvmeSubsystem> {
        let mut state = self.lock();
        state.check_fail("create_subsystem")?;
        if state.subsystems.values().any(|sub| sub.name == name) {
            return Err(ZnasError::Engine(
                ErrorEnum::AlreadyExists,
                format!("subsystem {name} already exists"),
            ));
        }
        let sub = NvmeSubsystem {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            nqn: nqn.to_string(),
        };
        state.subsystems.insert(sub.id.clone(), sub.clone());
        state.creations += 1;
        Ok(sub)
    }

    async fn find_subsystem(&self, name: &str) -> ZnasResult<Option<NvmeSubsystem>> {
        Ok(self
            .lock()
            .subsystems
            .values()
            .find(|sub| sub.name == name)
            .cloned())
    }

    async fn delete_subsystem(&self, id: &str) -> ZnasResult<()> {
        let mut state = self.lock();
        state.check_fail("delete_subsystem")?;
        state.subsystems.shift_remove(id).ok_or_else(|| {
            ZnasError::Engine(ErrorEnum::NotFound, format!("subsystem {id} not found"))
        })?;
        Ok(())
    }

    async fn create_namespace(
        &self,
        subsystem_id: &str,
        dataset: &str,
    ) -> ZnasResult<NvmeNamespace> {
        let mut state = self.lock();
        state.check_fail("create_namespace")?;
        if !state.subsystems.contains_key(subsystem_id) {
            return Err(ZnasError::Engine(
                ErrorEnum::NotFound,
                format!("subsystem {subsystem_id} not found"),
            ));
        }
        if state
            .namespaces
            .values()
            .any(|ns| ns.subsystem_id == subsystem_id && ns.dataset == dataset)
        {
            return Err(ZnasError::Engine(
                ErrorEnum::AlreadyExists,
                format!("a namespace for {dataset} already exists"),
            ));
        }
        let nsid = u32::try_from(state.namespaces.len()).unwrap_or(u32::MAX) + 1;
        let ns = NvmeNamespace {
            id: Uuid::new_v4().to_string(),
            subsystem_id: subsystem_id.to_string(),
            dataset: dataset.to_string(),
            nsid,
        };
        state.namespaces.insert(ns.id.clone(), ns.clone());
        state.creations += 1;
        Ok(ns)
    }

    async fn find_namespace(
        &self,
        subsystem_id: &str,
        dataset: &str,
    ) -> ZnasResult<Option<NvmeNamespace>> {
        Ok(self
            .lock()
            .namespaces
            .values()
            .find(|ns| ns.subsystem_id == subsystem_id && ns.dataset == dataset)
            .cloned())
    }

    async fn delete_namespace(&self, id: &str) -> ZnasResult<()> {
        let mut state = self.lock();
        state.check_fail("delete_namespace")?;
        state.namespaces.shift_remove(id).ok_or_else(|| {
            ZnasError::Engine(ErrorEnum::NotFound, format!("namespace {id} not found"))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::znas::{ErrorEnum, ZnasError};

    fn spec(name: &str) -> DatasetSpec {
        DatasetSpec {
            name: name.to_string(),
            kind: DatasetKind::Filesystem,
            capacity_bytes: Some(1 << 30),
            sparse: false,
            properties: HashMap::new(),
        }
    }

    #[tokio::test]
    /// A snapshot with a dependent clone cannot be destroyed, and
    /// neither can its dataset; once the clone is gone both can.
    async fn cow_dependency_blocks_destroy() {
        let sim = SimAppliance::new();
        sim.create_dataset(&spec("tank/v1")).await.unwrap();
        sim.create_snapshot("tank/v1", "s1").await.unwrap();
        sim.clone_snapshot("tank/v1", "s1", "tank/v2").await.unwrap();

        assert_matches!(
            sim.destroy_snapshot("tank/v1", "s1").await,
            Err(ZnasError::Engine(ErrorEnum::Busy, _))
        );
        assert_matches!(
            sim.destroy_dataset("tank/v1").await,
            Err(ZnasError::Engine(ErrorEnum::Busy, _))
        );

        sim.destroy_dataset("tank/v2").await.unwrap();
        sim.destroy_snapshot("tank/v1", "s1").await.unwrap();
        sim.destroy_dataset("tank/v1").await.unwrap();
    }

    #[tokio::test]
    /// Promotion moves the origin snapshot onto the clone and reverses
    /// the dependency direction.
    async fn promote_reverses_dependency() {
        let sim = SimAppliance::new();
        sim.create_dataset(&spec("tank/v1")).await.unwrap();
        sim.create_snapshot("tank/v1", "s1").await.unwrap();
        sim.clone_snapshot("tank/v1", "s1", "tank/v2").await.unwrap();
        sim.promote_dataset("tank/v2").await.unwrap();

        // The former parent is now the dependent side.
        assert_matches!(
            sim.destroy_dataset("tank/v2").await,
            Err(ZnasError::Engine(ErrorEnum::Busy, _))
        );
        sim.destroy_dataset("tank/v1").await.unwrap();
        sim.destroy_dataset("tank/v2").await.unwrap();
    }

    #[tokio::test]
    /// Promoting a dataset that is not a clone fails Invalid.
    async fn promote_non_clone() {
        let sim = SimAppliance::new();
        sim.create_dataset(&spec("tank/v1")).await.unwrap();
        assert_matches!(
            sim.promote_dataset("tank/v1").await,
            Err(ZnasError::Engine(ErrorEnum::Invalid, _))
        );
    }

    #[tokio::test]
    /// A replicated dataset has no origin and both sides can be
    /// destroyed in either order.
    async fn replication_is_independent() {
        let sim = SimAppliance::new();
        sim.create_dataset(&spec("tank/v1")).await.unwrap();
        sim.create_snapshot("tank/v1", "s1").await.unwrap();
        let job = sim
            .start_replication("tank/v1@s1", "tank/backup")
            .await
            .unwrap();
        assert_eq!(
            sim.replication_state(&job).await.unwrap(),
            ReplicationState::Done
        );

        let backup = sim.get_dataset("tank/backup").await.unwrap().unwrap();
        assert_eq!(backup.origin, None);
        // The replicated snapshot rides along.
        assert!(sim.get_snapshot("tank/backup", "s1").await.unwrap().is_some());

        sim.destroy_dataset("tank/v1").await.unwrap();
        sim.destroy_dataset("tank/backup").await.unwrap();
    }

    #[tokio::test]
    /// A delayed job reports Running for the configured number of polls
    /// before its terminal state.
    async fn replication_delay() {
        let sim = SimAppliance::new();
        sim.set_replication_delay(2);
        sim.create_dataset(&spec("tank/v1")).await.unwrap();
        sim.create_snapshot("tank/v1", "s1").await.unwrap();
        let job = sim
            .start_replication("tank/v1@s1", "tank/backup")
            .await
            .unwrap();
        assert_eq!(
            sim.replication_state(&job).await.unwrap(),
            ReplicationState::Running
        );
        assert_eq!(
            sim.replication_state(&job).await.unwrap(),
            ReplicationState::Running
        );
        assert_eq!(
            sim.replication_state(&job).await.unwrap(),
            ReplicationState::Done
        );
    }

    #[tokio::test]
    /// An armed failure fires exactly once.
    async fn fail_next_is_one_shot() {
        let sim = SimAppliance::new();
        sim.fail_next("create_dataset");
        assert_matches!(sim.create_dataset(&spec("tank/v1")).await, Err(_));
        assert_matches!(sim.create_dataset(&spec("tank/v1")).await, Ok(_));
    }
}
