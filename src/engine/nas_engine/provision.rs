// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-protocol provisioning step lists for the saga runner, and the
//! matching exposure teardown used by delete.
//!
//! Each step probes for a surviving resource before creating one, so a
//! retried provision after a partial failure reuses whatever its
//! earlier run left behind. The step lists are fixed per protocol:
//!
//! - NFS:     dataset -> NFS share
//! - iSCSI:   dataset -> target -> extent -> target/extent binding
//! - NVMe-oF: dataset -> fabric port check -> subsystem -> namespace

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;

use crate::{
    engine::{
        appliance::{ApplianceClient, DatasetSpec},
        nas_engine::{
            clone::{self, CloneParams},
            config::EngineConfig,
            names,
            saga::SagaStep,
        },
        types::{ExposureHandles, Name, Protocol, VolumeRecord},
    },
    znas::{ErrorEnum, ZnasError, ZnasResult},
};

/// Where the backing dataset comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DatasetSource {
    /// Freshly created with the requested capacity.
    New,
    /// Materialized from a snapshot.
    CloneOf(CloneParams),
}

/// Shared context threaded through the provisioning steps. Steps read
/// the request fields and accumulate exposure handles.
#[derive(Debug)]
pub struct ProvisionCtx {
    pub client: Arc<dyn ApplianceClient>,
    pub cfg: EngineConfig,
    pub name: Name,
    pub protocol: Protocol,
    pub capacity_bytes: u64,
    pub source: DatasetSource,
    pub dataset: String,
    pub handles: ExposureHandles,
}

/// The fixed step list for a protocol.
pub fn steps_for(protocol: Protocol) -> Vec<Box<dyn SagaStep<ProvisionCtx>>> {
    match protocol {
        Protocol::Nfs => vec![Box::new(EnsureDataset), Box::new(EnsureNfsShare)],
        Protocol::Iscsi => vec![
            Box::new(EnsureDataset),
            Box::new(EnsureTarget),
            Box::new(EnsureExtent),
            Box::new(EnsureTargetExtent),
        ],
        Protocol::Nvmeof => vec![
            Box::new(EnsureDataset),
            Box::new(CheckFabricPorts),
            Box::new(EnsureSubsystem),
            Box::new(EnsureNamespace),
        ],
    }
}

struct EnsureDataset;

#[async_trait]
impl SagaStep<ProvisionCtx> for EnsureDataset {
    fn name(&self) -> &'static str {
        "ensure-dataset"
    }

    async fn apply(&self, cx: &mut ProvisionCtx) -> ZnasResult<()> {
        let client = Arc::clone(&cx.client);
        let kind = cx.protocol.dataset_kind();
        if let Some(ds) = client.get_dataset(&cx.dataset).await? {
            if ds.kind != kind {
                return Err(ZnasError::Engine(
                    ErrorEnum::AlreadyExists,
                    format!(
                        "dataset {} exists with kind {:?}, protocol {} requires {kind:?}",
                        cx.dataset, ds.kind, cx.protocol
                    ),
                ));
            }
            return Ok(());
        }
        match &cx.source {
            DatasetSource::New => {
                let spec = DatasetSpec {
                    name: cx.dataset.clone(),
                    kind,
                    capacity_bytes: Some(cx.capacity_bytes),
                    sparse: cx.cfg.sparse_volumes,
                    properties: HashMap::new(),
                };
                match client.create_dataset(&spec).await {
                    Ok(_) => Ok(()),
                    // A concurrent create for the same name won the
                    // race; the appliance's name uniqueness is the
                    // arbiter and the loser re-queries.
                    Err(ZnasError::Engine(ErrorEnum::AlreadyExists, _)) => client
                        .get_dataset(&cx.dataset)
                        .await?
                        .map(|_| ())
                        .ok_or_else(|| {
                            ZnasError::Error(format!(
                                "dataset {} reported existing but cannot be read",
                                cx.dataset
                            ))
                        }),
                    Err(err) => Err(err),
                }
            }
            DatasetSource::CloneOf(params) => {
                clone::materialize(client.as_ref(), &cx.cfg, &cx.dataset, params)
                    .await
                    .map(|_| ())
            }
        }
    }

    async fn revert(&self, cx: &mut ProvisionCtx) -> ZnasResult<()> {
        match cx.client.destroy_dataset(&cx.dataset).await {
            Ok(()) | Err(ZnasError::Engine(ErrorEnum::NotFound, _)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

struct EnsureNfsShare;

#[async_trait]
impl SagaStep<ProvisionCtx> for EnsureNfsShare {
    fn name(&self) -> &'static str {
        "ensure-nfs-share"
    }

    async fn apply(&self, cx: &mut ProvisionCtx) -> ZnasResult<()> {
        if cx.cfg.nfs.is_none() {
            return Err(ZnasError::Engine(
                ErrorEnum::Busy,
                "NFS exposure is not configured".to_string(),
            ));
        }
        let client = Arc::clone(&cx.client);
        let path = names::mount_path(&cx.dataset);
        let share = match client.find_nfs_share(&path).await? {
            Some(share) => share,
            None => client.create_nfs_share(&path).await?,
        };
        cx.handles.share_id = Some(share.id);
        Ok(())
    }

    async fn revert(&self, cx: &mut ProvisionCtx) -> ZnasResult<()> {
        if let Some(id) = cx.handles.share_id.take() {
            match cx.client.delete_nfs_share(&id).await {
                Ok(()) | Err(ZnasError::Engine(ErrorEnum::NotFound, _)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

struct EnsureTarget;

#[async_trait]
impl SagaStep<ProvisionCtx> for EnsureTarget {
    fn name(&self) -> &'static str {
        "ensure-iscsi-target"
    }

    async fn apply(&self, cx: &mut ProvisionCtx) -> ZnasResult<()> {
        if cx.cfg.iscsi.is_none() {
            return Err(ZnasError::Engine(
                ErrorEnum::Busy,
                "iSCSI exposure is not configured".to_string(),
            ));
        }
        let client = Arc::clone(&cx.client);
        let target = match client.find_target(&cx.name).await? {
            Some(target) => target,
            None => client.create_target(&cx.name).await?,
        };
        cx.handles.target_id = Some(target.id);
        Ok(())
    }

    async fn revert(&self, cx: &mut ProvisionCtx) -> ZnasResult<()> {
        if let Some(id) = cx.handles.target_id.take() {
            match cx.client.delete_target(&id).await {
                Ok(()) | Err(ZnasError::Engine(ErrorEnum::NotFound, _)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

struct EnsureExtent;

#[async_trait]
impl SagaStep<ProvisionCtx> for EnsureExtent {
    fn name(&self) -> &'static str {
        "ensure-iscsi-extent"
    }

    async fn apply(&self, cx: &mut ProvisionCtx) -> ZnasResult<()> {
        let client = Arc::clone(&cx.client);
        let extent = match client.find_extent(&cx.name).await? {
            Some(extent) => extent,
            None => {
                client
                    .create_extent(&cx.name, &names::zvol_device_path(&cx.dataset))
                    .await?
            }
        };
        cx.handles.extent_id = Some(extent.id);
        Ok(())
    }

    async fn revert(&self, cx: &mut ProvisionCtx) -> ZnasResult<()> {
        if let Some(id) = cx.handles.extent_id.take() {
            match cx.client.delete_extent(&id).await {
                Ok(()) | Err(ZnasError::Engine(ErrorEnum::NotFound, _)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

struct EnsureTargetExtent;

#[async_trait]
impl SagaStep<ProvisionCtx> for EnsureTargetExtent {
    fn name(&self) -> &'static str {
        "ensure-iscsi-target-extent"
    }

    async fn apply(&self, cx: &mut ProvisionCtx) -> ZnasResult<()> {
        let client = Arc::clone(&cx.client);
        let (target_id, extent_id) = match (&cx.handles.target_id, &cx.handles.extent_id) {
            (Some(target_id), Some(extent_id)) => (target_id.clone(), extent_id.clone()),
            _ => {
                return Err(ZnasError::Error(
                    "target and extent handles must precede their binding".to_string(),
                ))
            }
        };
        let binding = match client.find_target_extent(&target_id, &extent_id).await? {
            Some(binding) => binding,
            None => client.bind_target_extent(&target_id, &extent_id, 0).await?,
        };
        cx.handles.iscsi_lun = Some(binding.lun);
        cx.handles.target_extent_id = Some(binding.id);
        Ok(())
    }

    async fn revert(&self, cx: &mut ProvisionCtx) -> ZnasResult<()> {
        if let Some(id) = cx.handles.target_extent_id.take() {
            match cx.client.delete_target_extent(&id).await {
                Ok(()) | Err(ZnasError::Engine(ErrorEnum::NotFound, _)) => {}
                Err(err) => return Err(err),
            }
        }
        cx.handles.iscsi_lun = None;
        Ok(())
    }
}

struct CheckFabricPorts;

#[async_trait]
impl SagaStep<ProvisionCtx> for CheckFabricPorts {
    fn name(&self) -> &'static str {
        "check-fabric-ports"
    }

    async fn apply(&self, cx: &mut ProvisionCtx) -> ZnasResult<()> {
        if cx.cfg.nvmeof.is_none() {
            return Err(ZnasError::Engine(
                ErrorEnum::Busy,
                "NVMe-oF exposure is not configured".to_string(),
            ));
        }
        if cx.client.list_fabric_ports().await?.is_empty() {
            return Err(ZnasError::Engine(
                ErrorEnum::Busy,
                "no NVMe-oF ports are configured on the appliance".to_string(),
            ));
        }
        Ok(())
    }

    async fn revert(&self, _cx: &mut ProvisionCtx) -> ZnasResult<()> {
        Ok(())
    }
}

struct EnsureSubsystem;

#[async_trait]
impl SagaStep<ProvisionCtx> for EnsureSubsystem {
    fn name(&self) -> &'static str {
        "ensure-nvmeof-subsystem"
    }

    async fn apply(&self, cx: &mut ProvisionCtx) -> ZnasResult<()> {
        let nqn_base = match &cx.cfg.nvmeof {
            Some(nvmeof) => nvmeof.nqn_base.clone(),
            None => {
                return Err(ZnasError::Engine(
                    ErrorEnum::Busy,
                    "NVMe-oF exposure is not configured".to_string(),
                ))
            }
        };
        let client = Arc::clone(&cx.client);
        let subsystem = match client.find_subsystem(&cx.name).await? {
            Some(subsystem) => subsystem,
            None => {
                client
                    .create_subsystem(&cx.name, &names::nqn(&nqn_base, &cx.name))
                    .await?
            }
        };
        cx.handles.subsystem_nqn = Some(subsystem.nqn);
        cx.handles.subsystem_id = Some(subsystem.id);
        Ok(())
    }

    async fn revert(&self, cx: &mut ProvisionCtx) -> ZnasResult<()> {
        cx.handles.subsystem_nqn = None;
        if let Some(id) = cx.handles.subsystem_id.take() {
            match cx.client.delete_subsystem(&id).await {
                Ok(()) | Err(ZnasError::Engine(ErrorEnum::NotFound, _)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

struct EnsureNamespace;

#[async_trait]
impl SagaStep<ProvisionCtx> for EnsureNamespace {
    fn name(&self) -> &'static str {
        "ensure-nvmeof-namespace"
    }

    async fn apply(&self, cx: &mut ProvisionCtx) -> ZnasResult<()> {
        let client = Arc::clone(&cx.client);
        let subsystem_id = cx.handles.subsystem_id.clone().ok_or_else(|| {
            ZnasError::Error("subsystem handle must precede its namespace".to_string())
        })?;
        let namespace = match client.find_namespace(&subsystem_id, &cx.dataset).await? {
            Some(namespace) => namespace,
            None => client.create_namespace(&subsystem_id, &cx.dataset).await?,
        };
        cx.handles.namespace_nsid = Some(namespace.nsid);
        cx.handles.namespace_id = Some(namespace.id);
        Ok(())
    }

    async fn revert(&self, cx: &mut ProvisionCtx) -> ZnasResult<()> {
        cx.handles.namespace_nsid = None;
        if let Some(id) = cx.handles.namespace_id.take() {
            match cx.client.delete_namespace(&id).await {
                Ok(()) | Err(ZnasError::Engine(ErrorEnum::NotFound, _)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

async fn delete_ignoring_absent<F>(result: F) -> ZnasResult<()>
where
    F: std::future::Future<Output = ZnasResult<()>>,
{
    match result.await {
        Ok(()) | Err(ZnasError::Engine(ErrorEnum::NotFound, _)) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Destroy a volume's exposure objects in reverse creation order.
/// Handles come from the record's properties; objects the properties
/// never captured are found by name so adoption gaps still tear down
/// cleanly. Absence at any point is success.
pub async fn teardown_exposure(
    client: &dyn ApplianceClient,
    record: &VolumeRecord,
) -> ZnasResult<()> {
    match record.protocol {
        Protocol::Nfs => {
            let share_id = match &record.handles.share_id {
                Some(id) => Some(id.clone()),
                None => client
                    .find_nfs_share(&names::mount_path(&record.dataset))
                    .await?
                    .map(|share| share.id),
            };
            if let Some(id) = share_id {
                delete_ignoring_absent(client.delete_nfs_share(&id)).await?;
            }
        }
        Protocol::Iscsi => {
            let target_id = match &record.handles.target_id {
                Some(id) => Some(id.clone()),
                None => client.find_target(&record.name).await?.map(|t| t.id),
            };
            let extent_id = match &record.handles.extent_id {
                Some(id) => Some(id.clone()),
                None => client.find_extent(&record.name).await?.map(|e| e.id),
            };
            let binding_id = match &record.handles.target_extent_id {
                Some(id) => Some(id.clone()),
                None => match (&target_id, &extent_id) {
                    (Some(target_id), Some(extent_id)) => client
                        .find_target_extent(target_id, extent_id)
                        .await?
                        .map(|te| te.id),
                    _ => None,
                },
            };
            if let Some(id) = binding_id {
                delete_ignoring_absent(client.delete_target_extent(&id)).await?;
            }
            if let Some(id) = extent_id {
                delete_ignoring_absent(client.delete_extent(&id)).await?;
            }
            if let Some(id) = target_id {
                delete_ignoring_absent(client.delete_target(&id)).await?;
            }
        }
        Protocol::Nvmeof => {
            let subsystem_id = match &record.handles.subsystem_id {
                Some(id) => Some(id.clone()),
                None => client.find_subsystem(&record.name).await?.map(|s| s.id),
            };
            let namespace_id = match &record.handles.namespace_id {
                Some(id) => Some(id.clone()),
                None => match &subsystem_id {
                    Some(subsystem_id) => client
                        .find_namespace(subsystem_id, &record.dataset)
                        .await?
                        .map(|ns| ns.id),
                    None => None,
                },
            };
            if let Some(id) = namespace_id {
                delete_ignoring_absent(client.delete_namespace(&id)).await?;
            }
            if let Some(id) = subsystem_id {
                delete_ignoring_absent(client.delete_subsystem(&id)).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::engine::{
        appliance::SimAppliance,
        nas_engine::saga::run_saga,
    };

    fn ctx(sim: &Arc<SimAppliance>, protocol: Protocol, name: &str) -> ProvisionCtx {
        let cfg = EngineConfig::default();
        let dataset = cfg.volume_dataset(name);
        ProvisionCtx {
            client: Arc::clone(sim) as Arc<dyn ApplianceClient>,
            cfg,
            name: Name::new(name.to_string()),
            protocol,
            capacity_bytes: 1 << 30,
            source: DatasetSource::New,
            dataset,
            handles: ExposureHandles::default(),
        }
    }

    #[tokio::test]
    /// A full iSCSI provision creates the dataset, target, extent, and
    /// binding, and records every handle.
    async fn iscsi_provision_sets_handles() {
        let sim = Arc::new(SimAppliance::new());
        let mut cx = ctx(&sim, Protocol::Iscsi, "pvc-1");
        run_saga(&steps_for(Protocol::Iscsi), &mut cx).await.unwrap();
        assert!(cx.handles.target_id.is_some());
        assert!(cx.handles.extent_id.is_some());
        assert!(cx.handles.target_extent_id.is_some());
        assert_eq!(cx.handles.iscsi_lun, Some(0));
        let counts = sim.counts();
        assert_eq!(
            (counts.datasets, counts.targets, counts.extents, counts.target_extents),
            (1, 1, 1, 1)
        );
    }

    #[tokio::test]
    /// When the binding step fails, the earlier steps are reverted and
    /// nothing remains discoverable on the appliance.
    async fn iscsi_rollback_leaves_nothing() {
        let sim = Arc::new(SimAppliance::new());
        sim.fail_next("bind_target_extent");
        let mut cx = ctx(&sim, Protocol::Iscsi, "pvc-1");
        assert_matches!(
            run_saga(&steps_for(Protocol::Iscsi), &mut cx).await,
            Err(_)
        );
        let counts = sim.counts();
        assert_eq!(
            (counts.datasets, counts.targets, counts.extents, counts.target_extents),
            (0, 0, 0, 0)
        );
    }

    #[tokio::test]
    /// Re-running a completed provision creates nothing new and
    /// rediscovers the same handles.
    async fn rerun_is_idempotent() {
        let sim = Arc::new(SimAppliance::new());
        let mut first = ctx(&sim, Protocol::Nfs, "pvc-1");
        run_saga(&steps_for(Protocol::Nfs), &mut first).await.unwrap();
        let creations = sim.creation_count();

        let mut second = ctx(&sim, Protocol::Nfs, "pvc-1");
        run_saga(&steps_for(Protocol::Nfs), &mut second).await.unwrap();
        assert_eq!(sim.creation_count(), creations);
        assert_eq!(second.handles.share_id, first.handles.share_id);
    }

    #[tokio::test]
    /// A retried provision picks up resources a failed earlier attempt
    /// left behind instead of erroring on them.
    async fn retry_reuses_survivors() {
        let sim = Arc::new(SimAppliance::new());
        // First attempt dies creating the extent; rollback then fails
        // to remove the target, leaving a survivor.
        sim.fail_next("create_extent");
        sim.fail_next("delete_target");
        let mut cx = ctx(&sim, Protocol::Iscsi, "pvc-1");
        assert_matches!(
            run_saga(&steps_for(Protocol::Iscsi), &mut cx).await,
            Err(_)
        );
        assert_eq!(sim.counts().targets, 1);

        let mut retry = ctx(&sim, Protocol::Iscsi, "pvc-1");
        run_saga(&steps_for(Protocol::Iscsi), &mut retry).await.unwrap();
        assert_eq!(sim.counts().targets, 1);
        assert!(retry.handles.target_extent_id.is_some());
    }

    #[tokio::test]
    /// With no fabric ports configured the NVMe-oF provision fails its
    /// precondition check and reverts the dataset.
    async fn nvmeof_requires_ports() {
        let sim = Arc::new(SimAppliance::new());
        let mut cx = ctx(&sim, Protocol::Nvmeof, "pvc-1");
        assert_matches!(
            run_saga(&steps_for(Protocol::Nvmeof), &mut cx).await,
            Err(ZnasError::Engine(ErrorEnum::Busy, _))
        );
        assert_eq!(sim.counts().datasets, 0);

        sim.add_fabric_port("192.0.2.7:4420");
        let mut retry = ctx(&sim, Protocol::Nvmeof, "pvc-1");
        run_saga(&steps_for(Protocol::Nvmeof), &mut retry).await.unwrap();
        assert!(retry.handles.namespace_id.is_some());
    }

    #[tokio::test]
    /// Teardown removes exposure objects even when the record carries
    /// no handles, by falling back to name lookup.
    async fn teardown_without_handles() {
        let sim = Arc::new(SimAppliance::new());
        let mut cx = ctx(&sim, Protocol::Iscsi, "pvc-1");
        run_saga(&steps_for(Protocol::Iscsi), &mut cx).await.unwrap();

        let record = VolumeRecord {
            name: cx.name.clone(),
            protocol: Protocol::Iscsi,
            dataset: cx.dataset.clone(),
            capacity_bytes: None,
            delete_strategy: Default::default(),
            handles: ExposureHandles::default(),
            adoption: Default::default(),
            source_volume: None,
            origin_snapshot: None,
            created_at: None,
        };
        teardown_exposure(sim.as_ref(), &record).await.unwrap();
        let counts = sim.counts();
        assert_eq!((counts.targets, counts.extents, counts.target_extents), (0, 0, 0));
    }
}
