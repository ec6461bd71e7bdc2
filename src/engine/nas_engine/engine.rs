// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The production lifecycle engine: composes discovery, the
//! provisioning saga, the clone engine, and the identifier codec into
//! the operations the protocol server calls.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use itertools::Itertools;
use log::{info, warn};
use serde_json::{json, Value};

use crate::{
    engine::{
        appliance::ApplianceClient,
        engine::Engine,
        nas_engine::{
            clone::{self, CloneParams},
            config::EngineConfig,
            discovery, names,
            names::SnapshotParts,
            props,
            provision::{self, DatasetSource, ProvisionCtx},
            saga,
        },
        shared,
        types::{
            params, parse_bool_param, CloneMode, CreateAction, CreateSnapshotRequest,
            CreateVolumeRequest, DeleteAction, DeleteStrategy, Expansion, ExposureHandles,
            GrowAction, Name, ProvisionedSnapshot, ProvisionedVolume, SnapshotFilter,
            SnapshotPage, SnapshotRecord, VolumeParams, VolumeRecord,
        },
    },
    znas::{ErrorEnum, ZnasError, ZnasResult},
};

#[derive(Debug)]
pub struct NasEngine {
    client: Arc<dyn ApplianceClient>,
    cfg: EngineConfig,
}

impl NasEngine {
    /// Set up an engine against an appliance client. The configuration
    /// is validated here; the appliance is not contacted until the
    /// first operation.
    pub fn new(client: Arc<dyn ApplianceClient>, cfg: EngineConfig) -> ZnasResult<NasEngine> {
        cfg.validate()?;
        Ok(NasEngine { client, cfg })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    fn step_ctx(&self, request: &CreateVolumeRequest, source: DatasetSource) -> ProvisionCtx {
        ProvisionCtx {
            client: Arc::clone(&self.client),
            cfg: self.cfg.clone(),
            name: Name::new(request.name.clone()),
            protocol: request.protocol,
            capacity_bytes: request.capacity_bytes,
            source,
            dataset: self.cfg.volume_dataset(&request.name),
            handles: ExposureHandles::default(),
        }
    }

    fn provisioned(&self, record: &VolumeRecord) -> ZnasResult<ProvisionedVolume> {
        Ok(ProvisionedVolume {
            volume_id: names::encode_volume_id(record.protocol, &record.name)?,
            name: record.name.clone(),
            protocol: record.protocol,
            dataset: record.dataset.clone(),
            capacity_bytes: record.capacity_bytes.unwrap_or(0),
            context: props::context_map(record, &self.cfg)?,
        })
    }

    /// Write the durable property record. The volume is already usable
    /// when this runs, so failure is a warning: the cost is that
    /// discovery will not find the volume until a later retry or
    /// reconciliation rewrites the properties.
    async fn write_volume_props(&self, record: &VolumeRecord) {
        let map = props::volume_properties(record, &self.cfg.instance);
        if let Err(err) = self.client.set_properties(&record.dataset, &map).await {
            warn!(
                "failed to record durable properties for volume {}: {err}",
                record.name
            );
        }
    }

    /// Identity path shared by all create variants: if a compatible
    /// volume of this name already exists, re-ensure its exposure
    /// chain (re-attaching any handles that have gone missing), refresh
    /// its properties, and report the existing resource.
    async fn existing_volume(
        &self,
        request: &CreateVolumeRequest,
    ) -> ZnasResult<Option<CreateAction<ProvisionedVolume>>> {
        let existing =
            match discovery::find_volume(self.client.as_ref(), &self.cfg, &request.name).await? {
                Some(existing) => existing,
                None => return Ok(None),
            };
        shared::create_volume_idempotent_or_err(&existing, request.protocol, request.capacity_bytes)?;
        let mut cx = self.step_ctx(request, DatasetSource::New);
        saga::run_saga(&provision::steps_for(request.protocol), &mut cx).await?;
        let mut record = existing;
        record.handles = cx.handles;
        self.write_volume_props(&record).await;
        info!("volume {} already exists; returned as found", record.name);
        Ok(Some(CreateAction::Identity(self.provisioned(&record)?)))
    }

    /// Provision a volume that discovery did not find. A raw dataset
    /// squatting on the target path is either adopted (when the
    /// request or the dataset says it may be) or reported as a name
    /// collision.
    async fn provision_new(
        &self,
        request: &CreateVolumeRequest,
        vol_params: &VolumeParams,
        source: DatasetSource,
        source_volume: Option<String>,
        origin_snapshot: Option<String>,
    ) -> ZnasResult<CreateAction<ProvisionedVolume>> {
        if let Some(ds) =
            discovery::probe_dataset(self.client.as_ref(), &self.cfg, &request.name).await?
        {
            let ds_adoptable = ds
                .user_properties
                .get(props::PROP_ADOPTABLE)
                .map(|v| v == "true")
                .unwrap_or(false);
            if !(vol_params.adoption.adoptable || ds_adoptable) {
                return Err(ZnasError::Engine(
                    ErrorEnum::AlreadyExists,
                    format!(
                        "dataset {} already exists and is not managed by this engine",
                        ds.name
                    ),
                ));
            }
            if ds.kind != request.protocol.dataset_kind() {
                return Err(ZnasError::Engine(
                    ErrorEnum::AlreadyExists,
                    format!(
                        "dataset {} exists with kind {:?}, protocol {} requires {:?}",
                        ds.name,
                        ds.kind,
                        request.protocol,
                        request.protocol.dataset_kind()
                    ),
                ));
            }
            info!(
                "adopting existing dataset {} for volume {}",
                ds.name, request.name
            );
        }

        let mut cx = self.step_ctx(request, source);
        saga::run_saga(&provision::steps_for(request.protocol), &mut cx).await?;

        // Clone requests may leave the capacity unspecified; record
        // what the materialized dataset actually reports.
        let capacity_bytes = if request.capacity_bytes > 0 {
            Some(request.capacity_bytes)
        } else {
            self.client
                .get_dataset(&cx.dataset)
                .await?
                .and_then(|ds| ds.capacity_bytes)
        };
        let record = VolumeRecord {
            name: cx.name.clone(),
            protocol: request.protocol,
            dataset: cx.dataset.clone(),
            capacity_bytes,
            delete_strategy: vol_params.delete_strategy,
            handles: cx.handles,
            adoption: vol_params.adoption.clone(),
            source_volume,
            origin_snapshot,
            created_at: Some(Utc::now()),
        };
        self.write_volume_props(&record).await;
        info!(
            "volume {} created on dataset {}",
            record.name, record.dataset
        );
        Ok(CreateAction::Created(self.provisioned(&record)?))
    }
}

#[async_trait]
impl Engine for NasEngine {
    async fn create_volume(
        &self,
        request: &CreateVolumeRequest,
    ) -> ZnasResult<CreateAction<ProvisionedVolume>> {
        shared::validate_name(&request.name)?;
        if request.capacity_bytes == 0 {
            return Err(ZnasError::Engine(
                ErrorEnum::Invalid,
                "a volume capacity must be specified".to_string(),
            ));
        }
        let vol_params = VolumeParams::from_parameters(&request.parameters)?;
        if let Some(identity) = self.existing_volume(request).await? {
            return Ok(identity);
        }
        self.provision_new(request, &vol_params, DatasetSource::New, None, None)
            .await
    }

    async fn create_volume_from_snapshot(
        &self,
        request: &CreateVolumeRequest,
        snapshot_id: &str,
    ) -> ZnasResult<CreateAction<ProvisionedVolume>> {
        shared::validate_name(&request.name)?;
        let vol_params = VolumeParams::from_parameters(&request.parameters)?;
        let parts = names::decode_snapshot_id(snapshot_id)?;
        if let Some(identity) = self.existing_volume(request).await? {
            return Ok(identity);
        }
        let snapshot = discovery::find_snapshot(self.client.as_ref(), &self.cfg, &parts)
            .await?
            .ok_or_else(|| {
                ZnasError::Engine(
                    ErrorEnum::NotFound,
                    format!("snapshot {snapshot_id} not found"),
                )
            })?;
        if snapshot.protocol.dataset_kind() != request.protocol.dataset_kind() {
            return Err(ZnasError::Engine(
                ErrorEnum::Invalid,
                format!(
                    "snapshot {snapshot_id} backs a {:?} and cannot become a {} volume",
                    snapshot.protocol.dataset_kind(),
                    request.protocol
                ),
            ));
        }
        let (clone_params, origin_snapshot) = if snapshot.detached {
            let restore = clone::detached_restore_params(
                self.client.as_ref(),
                &self.cfg,
                &snapshot.name,
                &request.name,
            )
            .await?;
            let origin = Some(restore.snapshot.clone());
            (restore, origin)
        } else {
            let mode = vol_params.clone_mode;
            let origin = (mode == CloneMode::Cow).then(|| snapshot.name.clone());
            (
                CloneParams {
                    source_dataset: snapshot.source_dataset.clone(),
                    snapshot: snapshot.name.clone(),
                    mode,
                },
                origin,
            )
        };
        self.provision_new(
            request,
            &vol_params,
            DatasetSource::CloneOf(clone_params),
            Some(snapshot.source_volume.clone()),
            origin_snapshot,
        )
        .await
    }

    async fn create_volume_from_volume(
        &self,
        request: &CreateVolumeRequest,
        source_volume_id: &str,
    ) -> ZnasResult<CreateAction<ProvisionedVolume>> {
        shared::validate_name(&request.name)?;
        let vol_params = VolumeParams::from_parameters(&request.parameters)?;
        let parts = names::decode_volume_id(source_volume_id)?;
        if let Some(identity) = self.existing_volume(request).await? {
            return Ok(identity);
        }
        let source = discovery::find_volume(self.client.as_ref(), &self.cfg, &parts.volume)
            .await?
            .ok_or_else(|| {
                ZnasError::Engine(
                    ErrorEnum::NotFound,
                    format!("source volume {source_volume_id} not found"),
                )
            })?;
        if source.protocol.dataset_kind() != request.protocol.dataset_kind() {
            return Err(ZnasError::Engine(
                ErrorEnum::Invalid,
                format!(
                    "volume {source_volume_id} backs a {:?} and cannot become a {} volume",
                    source.protocol.dataset_kind(),
                    request.protocol
                ),
            ));
        }
        let transient = format!("clone-{}", request.name);
        clone::ensure_snapshot(self.client.as_ref(), &source.dataset, &transient).await?;
        let mode = vol_params.clone_mode;
        let origin_snapshot = (mode == CloneMode::Cow).then(|| transient.clone());
        let action = self
            .provision_new(
                request,
                &vol_params,
                DatasetSource::CloneOf(CloneParams {
                    source_dataset: source.dataset.clone(),
                    snapshot: transient.clone(),
                    mode,
                }),
                Some(source.name.to_owned()),
                origin_snapshot,
            )
            .await?;
        // A COW clone keeps depending on the transient snapshot; for
        // the other modes it has served its purpose.
        if mode != CloneMode::Cow {
            clone::destroy_snapshot_best_effort(self.client.as_ref(), &source.dataset, &transient)
                .await;
        }
        Ok(action)
    }

    async fn delete_volume(&self, volume_id: &str) -> ZnasResult<DeleteAction<Name>> {
        let parts = names::decode_volume_id(volume_id)?;
        let volume =
            match discovery::find_volume(self.client.as_ref(), &self.cfg, &parts.volume).await? {
                Some(volume) => volume,
                None => return Ok(DeleteAction::Identity),
            };
        provision::teardown_exposure(self.client.as_ref(), &volume).await?;
        match volume.delete_strategy {
            DeleteStrategy::Retain => {
                self.client
                    .clear_properties(&volume.dataset, props::VOLUME_KEYS)
                    .await?;
                info!(
                    "volume {} released; dataset {} retained",
                    volume.name, volume.dataset
                );
            }
            DeleteStrategy::Delete => {
                match self.client.destroy_dataset(&volume.dataset).await {
                    Ok(()) | Err(ZnasError::Engine(ErrorEnum::NotFound, _)) => {}
                    // Busy propagates: the dataset is still a
                    // dependency origin for clones.
                    Err(err) => return Err(err),
                }
                info!("volume {} deleted", volume.name);
            }
        }
        Ok(DeleteAction::Deleted(volume.name))
    }

    async fn expand_volume(
        &self,
        volume_id: &str,
        new_capacity_bytes: u64,
    ) -> ZnasResult<GrowAction<Expansion>> {
        if new_capacity_bytes == 0 {
            return Err(ZnasError::Engine(
                ErrorEnum::Invalid,
                "a target capacity must be specified".to_string(),
            ));
        }
        let parts = names::decode_volume_id(volume_id)?;
        let volume = discovery::find_volume(self.client.as_ref(), &self.cfg, &parts.volume)
            .await?
            .ok_or_else(|| {
                ZnasError::Engine(
                    ErrorEnum::NotFound,
                    format!("volume {volume_id} not found"),
                )
            })?;
        let node_expansion_required = volume.protocol.is_block();
        if let Some(current) = volume.capacity_bytes {
            if new_capacity_bytes <= current {
                return Ok(GrowAction::Identity(Expansion {
                    capacity_bytes: current,
                    node_expansion_required,
                }));
            }
        }
        self.client
            .resize_dataset(&volume.dataset, new_capacity_bytes)
            .await?;
        let update = HashMap::from([(
            props::PROP_CAPACITY.to_string(),
            new_capacity_bytes.to_string(),
        )]);
        if let Err(err) = self.client.set_properties(&volume.dataset, &update).await {
            warn!(
                "failed to record new capacity for volume {}: {err}",
                volume.name
            );
        }
        info!(
            "volume {} expanded to {new_capacity_bytes} bytes",
            volume.name
        );
        Ok(GrowAction::Grown(Expansion {
            capacity_bytes: new_capacity_bytes,
            node_expansion_required,
        }))
    }

    async fn create_snapshot(
        &self,
        request: &CreateSnapshotRequest,
    ) -> ZnasResult<CreateAction<ProvisionedSnapshot>> {
        shared::validate_name(&request.name)?;
        let detached = parse_bool_param(&request.parameters, params::DETACHED)?.unwrap_or(false);
        let source_parts = names::decode_volume_id(&request.source_volume_id)?;
        let volume =
            match discovery::find_volume(self.client.as_ref(), &self.cfg, &source_parts.volume)
                .await?
            {
                Some(volume) => volume,
                None => {
                    return Err(ZnasError::Engine(
                        ErrorEnum::NotFound,
                        format!("source volume {} not found", request.source_volume_id),
                    ))
                }
            };
        // A snapshot of the same name in the opposite flavor is an
        // incompatible collision, not an identity.
        let opposite = SnapshotParts {
            protocol: volume.protocol,
            volume: volume.name.to_owned(),
            snapshot: request.name.clone(),
            detached: !detached,
        };
        if let Some(existing) =
            discovery::find_snapshot(self.client.as_ref(), &self.cfg, &opposite).await?
        {
            shared::create_snapshot_idempotent_or_err(&existing, &volume.name, detached)?;
        }
        let wanted = SnapshotParts {
            detached,
            ..opposite
        };
        let preexisting =
            discovery::find_snapshot(self.client.as_ref(), &self.cfg, &wanted).await?;
        if let Some(existing) = &preexisting {
            shared::create_snapshot_idempotent_or_err(existing, &volume.name, detached)?;
        }

        let snapshot_id =
            names::encode_snapshot_id(volume.protocol, &volume.name, &request.name, detached)?;
        if detached {
            if let Some(existing) = preexisting {
                return Ok(CreateAction::Identity(ProvisionedSnapshot {
                    snapshot_id,
                    source_volume_id: request.source_volume_id.clone(),
                    created_at: existing.created_at.unwrap_or_default(),
                    ready: true,
                }));
            }
            let created_at = Utc::now();
            let record = SnapshotRecord {
                name: request.name.clone(),
                source_volume: volume.name.to_owned(),
                source_dataset: volume.dataset.clone(),
                protocol: volume.protocol,
                detached: true,
                created_at: Some(created_at),
            };
            let tags = props::snapshot_properties(&record, &self.cfg.instance);
            clone::create_detached_snapshot(
                self.client.as_ref(),
                &self.cfg,
                &volume.dataset,
                &request.name,
                &tags,
            )
            .await?;
            info!(
                "detached snapshot {} of volume {} created",
                request.name, volume.name
            );
            return Ok(CreateAction::Created(ProvisionedSnapshot {
                snapshot_id,
                source_volume_id: request.source_volume_id.clone(),
                created_at,
                ready: true,
            }));
        }

        let was_present = preexisting.is_some();
        let snap_info =
            clone::ensure_snapshot(self.client.as_ref(), &volume.dataset, &request.name).await?;
        let record = SnapshotRecord {
            name: snap_info.name.clone(),
            source_volume: volume.name.to_owned(),
            source_dataset: volume.dataset.clone(),
            protocol: volume.protocol,
            detached: false,
            created_at: Some(snap_info.created_at),
        };
        let tags = props::snapshot_properties(&record, &self.cfg.instance);
        if let Err(err) = self
            .client
            .set_snapshot_properties(&volume.dataset, &request.name, &tags)
            .await
        {
            warn!(
                "failed to tag snapshot {}@{}: {err}",
                volume.dataset, request.name
            );
        }
        let entry = ProvisionedSnapshot {
            snapshot_id,
            source_volume_id: request.source_volume_id.clone(),
            created_at: snap_info.created_at,
            ready: true,
        };
        if was_present {
            Ok(CreateAction::Identity(entry))
        } else {
            info!("snapshot {} of volume {} created", request.name, volume.name);
            Ok(CreateAction::Created(entry))
        }
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> ZnasResult<DeleteAction<String>> {
        let parts = names::decode_snapshot_id(snapshot_id)?;
        if parts.detached {
            let snapshot =
                match discovery::find_snapshot(self.client.as_ref(), &self.cfg, &parts).await? {
                    Some(snapshot) => snapshot,
                    None => return Ok(DeleteAction::Identity),
                };
            let dataset = self.cfg.detached_dataset(&snapshot.name);
            match self.client.destroy_dataset(&dataset).await {
                Ok(()) | Err(ZnasError::Engine(ErrorEnum::NotFound, _)) => {}
                // Busy propagates: restored volumes still depend on
                // the backup.
                Err(err) => return Err(err),
            }
            info!("detached snapshot {} deleted", snapshot.name);
            return Ok(DeleteAction::Deleted(snapshot_id.to_string()));
        }
        let volume =
            match discovery::find_volume(self.client.as_ref(), &self.cfg, &parts.volume).await? {
                Some(volume) => volume,
                // With the source volume gone its native snapshots are
                // gone too.
                None => return Ok(DeleteAction::Identity),
            };
        match self
            .client
            .destroy_snapshot(&volume.dataset, &parts.snapshot)
            .await
        {
            Ok(()) => {
                info!(
                    "snapshot {} of volume {} deleted",
                    parts.snapshot, volume.name
                );
                Ok(DeleteAction::Deleted(snapshot_id.to_string()))
            }
            Err(ZnasError::Engine(ErrorEnum::NotFound, _)) => Ok(DeleteAction::Identity),
            Err(err) => Err(err),
        }
    }

    async fn list_snapshots(&self, filter: &SnapshotFilter) -> ZnasResult<SnapshotPage> {
        let client = self.client.as_ref();
        let mut records: Vec<SnapshotRecord> = Vec::new();
        if let Some(id) = &filter.snapshot_id {
            // An undecodable or unknown id simply matches nothing.
            if let Ok(parts) = names::decode_snapshot_id(id) {
                if let Some(record) = discovery::find_snapshot(client, &self.cfg, &parts).await? {
                    records.push(record);
                }
            }
        } else if let Some(source_id) = &filter.source_volume_id {
            if let Ok(parts) = names::decode_volume_id(source_id) {
                if let Some(volume) =
                    discovery::find_volume(client, &self.cfg, &parts.volume).await?
                {
                    records.extend(
                        discovery::list_native_snapshots(
                            client,
                            &self.cfg,
                            Some(&volume.dataset),
                        )
                        .await?,
                    );
                }
                // Detached snapshots outlive their source volume.
                records.extend(
                    discovery::list_detached_snapshots(client, &self.cfg, Some(&parts.volume))
                        .await?,
                );
            }
        } else {
            records.extend(discovery::list_native_snapshots(client, &self.cfg, None).await?);
            records.extend(discovery::list_detached_snapshots(client, &self.cfg, None).await?);
        }

        let entries = records
            .iter()
            .map(|record| {
                Ok(ProvisionedSnapshot {
                    snapshot_id: names::encode_snapshot_id(
                        record.protocol,
                        &record.source_volume,
                        &record.name,
                        record.detached,
                    )?,
                    source_volume_id: names::encode_volume_id(
                        record.protocol,
                        &record.source_volume,
                    )?,
                    created_at: record.created_at.unwrap_or_default(),
                    ready: true,
                })
            })
            .collect::<ZnasResult<Vec<_>>>()?
            .into_iter()
            .sorted_by(|a, b| a.snapshot_id.cmp(&b.snapshot_id))
            .collect::<Vec<_>>();

        let start = match &filter.page_token {
            None => 0,
            Some(token) => entries
                .iter()
                .position(|entry| &entry.snapshot_id == token)
                .ok_or_else(|| {
                    ZnasError::Engine(
                        ErrorEnum::Invalid,
                        format!("unrecognized page token {token}"),
                    )
                })?,
        };
        let page_size = filter.page_size.filter(|size| *size > 0).unwrap_or(entries.len());
        let end = (start + page_size).min(entries.len());
        let next_token = (end < entries.len()).then(|| entries[end].snapshot_id.clone());
        Ok(SnapshotPage {
            entries: entries[start..end].to_vec(),
            next_token,
        })
    }

    async fn engine_state_report(&self) -> ZnasResult<Value> {
        let client = self.client.as_ref();
        let volumes = discovery::list_volumes(client, &self.cfg)
            .await?
            .into_iter()
            .sorted_by(|a, b| a.name.as_ref().cmp(b.name.as_ref()))
            .collect::<Vec<_>>();
        let mut snapshots = discovery::list_native_snapshots(client, &self.cfg, None).await?;
        snapshots.extend(discovery::list_detached_snapshots(client, &self.cfg, None).await?);
        let snapshots = snapshots
            .into_iter()
            .sorted_by(|a, b| a.name.cmp(&b.name))
            .collect::<Vec<_>>();
        Ok(json!({
            "instance": self.cfg.instance,
            "volumes": serde_json::to_value(volumes)?,
            "snapshots": serde_json::to_value(snapshots)?,
        }))
    }
}
