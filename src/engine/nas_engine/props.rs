// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The durable property schema written to appliance-side datasets and
//! snapshots, and the conversions between records and property maps.
//!
//! Properties are the engine's only durable record: a `VolumeRecord`
//! must be reconstructible from the property map alone. Values parse
//! tolerantly; a missing or malformed value decodes to its absent
//! form rather than failing the whole record, so resources written by
//! earlier schema versions remain discoverable.

use std::{collections::HashMap, str::FromStr};

use chrono::{DateTime, Utc};

use crate::{
    engine::{
        appliance::{Dataset, SnapshotInfo},
        nas_engine::{config::EngineConfig, names},
        types::{
            AdoptionMeta, DeleteStrategy, ExposureHandles, Name, Protocol, SnapshotRecord,
            VolumeRecord,
        },
    },
    znas::{ErrorEnum, ZnasError, ZnasResult},
};

pub const PROP_MANAGED_BY: &str = "znas:managed_by";
pub const PROP_SCHEMA_VERSION: &str = "znas:schema_version";
pub const PROP_VOLUME_NAME: &str = "znas:volume_name";
pub const PROP_PROTOCOL: &str = "znas:protocol";
pub const PROP_CAPACITY: &str = "znas:capacity_bytes";
pub const PROP_DELETE_STRATEGY: &str = "znas:delete_strategy";
pub const PROP_SOURCE_VOLUME: &str = "znas:source_volume";
pub const PROP_SOURCE_DATASET: &str = "znas:source_dataset";
pub const PROP_ORIGIN_SNAPSHOT: &str = "znas:origin_snapshot";
pub const PROP_DETACHED: &str = "znas:detached_snapshot";
pub const PROP_SNAPSHOT_NAME: &str = "znas:snapshot_name";
pub const PROP_CREATED_AT: &str = "znas:created_at";
pub const PROP_SHARE_ID: &str = "znas:share_id";
pub const PROP_TARGET_ID: &str = "znas:target_id";
pub const PROP_EXTENT_ID: &str = "znas:extent_id";
pub const PROP_TARGET_EXTENT_ID: &str = "znas:target_extent_id";
pub const PROP_ISCSI_LUN: &str = "znas:iscsi_lun";
pub const PROP_SUBSYSTEM_ID: &str = "znas:subsystem_id";
pub const PROP_SUBSYSTEM_NQN: &str = "znas:subsystem_nqn";
pub const PROP_NAMESPACE_ID: &str = "znas:namespace_id";
pub const PROP_NAMESPACE_NSID: &str = "znas:namespace_nsid";
pub const PROP_PVC_NAME: &str = "znas:pvc_name";
pub const PROP_PVC_NAMESPACE: &str = "znas:pvc_namespace";
pub const PROP_STORAGE_CLASS: &str = "znas:storage_class";
pub const PROP_ADOPTABLE: &str = "znas:adoptable";

pub const SCHEMA_VERSION: &str = "1";

/// Handle properties, cleared when exposure objects are torn down.
pub const HANDLE_KEYS: &[&str] = &[
    PROP_SHARE_ID,
    PROP_TARGET_ID,
    PROP_EXTENT_ID,
    PROP_TARGET_EXTENT_ID,
    PROP_ISCSI_LUN,
    PROP_SUBSYSTEM_ID,
    PROP_SUBSYSTEM_NQN,
    PROP_NAMESPACE_ID,
    PROP_NAMESPACE_NSID,
];

/// Every key the engine writes on a volume dataset. A retain-strategy
/// delete clears all of these so the surviving dataset is no longer
/// discoverable as a managed volume.
pub const VOLUME_KEYS: &[&str] = &[
    PROP_MANAGED_BY,
    PROP_SCHEMA_VERSION,
    PROP_VOLUME_NAME,
    PROP_PROTOCOL,
    PROP_CAPACITY,
    PROP_DELETE_STRATEGY,
    PROP_SOURCE_VOLUME,
    PROP_ORIGIN_SNAPSHOT,
    PROP_CREATED_AT,
    PROP_PVC_NAME,
    PROP_PVC_NAMESPACE,
    PROP_STORAGE_CLASS,
    PROP_ADOPTABLE,
    PROP_SHARE_ID,
    PROP_TARGET_ID,
    PROP_EXTENT_ID,
    PROP_TARGET_EXTENT_ID,
    PROP_ISCSI_LUN,
    PROP_SUBSYSTEM_ID,
    PROP_SUBSYSTEM_NQN,
    PROP_NAMESPACE_ID,
    PROP_NAMESPACE_NSID,
];

/// Keys of the orchestrator-facing volume context map.
pub mod context {
    pub const DATASET: &str = "dataset";
    pub const PROTOCOL: &str = "protocol";
    pub const NFS_SERVER: &str = "nfsServer";
    pub const NFS_EXPORT: &str = "nfsExport";
    pub const ISCSI_PORTAL: &str = "iscsiPortal";
    pub const ISCSI_IQN: &str = "iscsiIqn";
    pub const ISCSI_LUN: &str = "iscsiLun";
    pub const NVMEOF_ADDRESS: &str = "nvmeofTransportAddress";
    pub const NVMEOF_NQN: &str = "nvmeofNqn";
    pub const NVMEOF_NSID: &str = "nvmeofNsid";
}

fn get(props: &HashMap<String, String>, key: &str) -> Option<String> {
    props.get(key).cloned()
}

fn parse_u64(props: &HashMap<String, String>, key: &str) -> Option<u64> {
    props.get(key).and_then(|v| v.parse::<u64>().ok())
}

fn parse_u32(props: &HashMap<String, String>, key: &str) -> Option<u32> {
    props.get(key).and_then(|v| v.parse::<u32>().ok())
}

fn parse_bool(props: &HashMap<String, String>, key: &str) -> bool {
    props.get(key).map(|v| v == "true").unwrap_or(false)
}

fn parse_time(props: &HashMap<String, String>, key: &str) -> Option<DateTime<Utc>> {
    props
        .get(key)
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn insert(map: &mut HashMap<String, String>, key: &str, value: &str) {
    map.insert(key.to_string(), value.to_string());
}

fn insert_opt(map: &mut HashMap<String, String>, key: &str, value: Option<&String>) {
    if let Some(value) = value {
        map.insert(key.to_string(), value.clone());
    }
}

/// Render a volume record as the property map written to its backing
/// dataset.
pub fn volume_properties(record: &VolumeRecord, instance: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    insert(&mut map, PROP_MANAGED_BY, instance);
    insert(&mut map, PROP_SCHEMA_VERSION, SCHEMA_VERSION);
    insert(&mut map, PROP_VOLUME_NAME, &record.name);
    insert(&mut map, PROP_PROTOCOL, &record.protocol.to_string());
    if let Some(capacity) = record.capacity_bytes {
        insert(&mut map, PROP_CAPACITY, &capacity.to_string());
    }
    insert(
        &mut map,
        PROP_DELETE_STRATEGY,
        &record.delete_strategy.to_string(),
    );
    insert_opt(&mut map, PROP_SOURCE_VOLUME, record.source_volume.as_ref());
    insert_opt(
        &mut map,
        PROP_ORIGIN_SNAPSHOT,
        record.origin_snapshot.as_ref(),
    );
    if let Some(created_at) = record.created_at {
        insert(&mut map, PROP_CREATED_AT, &created_at.to_rfc3339());
    }
    let handles = &record.handles;
    insert_opt(&mut map, PROP_SHARE_ID, handles.share_id.as_ref());
    insert_opt(&mut map, PROP_TARGET_ID, handles.target_id.as_ref());
    insert_opt(&mut map, PROP_EXTENT_ID, handles.extent_id.as_ref());
    insert_opt(
        &mut map,
        PROP_TARGET_EXTENT_ID,
        handles.target_extent_id.as_ref(),
    );
    if let Some(lun) = handles.iscsi_lun {
        insert(&mut map, PROP_ISCSI_LUN, &lun.to_string());
    }
    insert_opt(&mut map, PROP_SUBSYSTEM_ID, handles.subsystem_id.as_ref());
    insert_opt(&mut map, PROP_SUBSYSTEM_NQN, handles.subsystem_nqn.as_ref());
    insert_opt(&mut map, PROP_NAMESPACE_ID, handles.namespace_id.as_ref());
    if let Some(nsid) = handles.namespace_nsid {
        insert(&mut map, PROP_NAMESPACE_NSID, &nsid.to_string());
    }
    let adoption = &record.adoption;
    insert_opt(&mut map, PROP_PVC_NAME, adoption.pvc_name.as_ref());
    insert_opt(&mut map, PROP_PVC_NAMESPACE, adoption.pvc_namespace.as_ref());
    insert_opt(&mut map, PROP_STORAGE_CLASS, adoption.storage_class.as_ref());
    if adoption.adoptable {
        insert(&mut map, PROP_ADOPTABLE, "true");
    }
    map
}

/// Reconstruct a volume record from a dataset's properties. Returns
/// `None` when the dataset is not managed by this engine instance: no
/// marker, another owner's marker, or a record too damaged to name its
/// volume and protocol.
pub fn volume_record_from_dataset(ds: &Dataset, instance: &str) -> Option<VolumeRecord> {
    let props = &ds.user_properties;
    if get(props, PROP_MANAGED_BY).as_deref() != Some(instance) {
        return None;
    }
    let name = get(props, PROP_VOLUME_NAME)?;
    let protocol = Protocol::from_str(&get(props, PROP_PROTOCOL)?).ok()?;
    let delete_strategy = get(props, PROP_DELETE_STRATEGY)
        .and_then(|v| DeleteStrategy::from_str(&v).ok())
        .unwrap_or_default();
    Some(VolumeRecord {
        name: Name::new(name),
        protocol,
        dataset: ds.name.clone(),
        capacity_bytes: parse_u64(props, PROP_CAPACITY),
        delete_strategy,
        handles: ExposureHandles {
            share_id: get(props, PROP_SHARE_ID),
            target_id: get(props, PROP_TARGET_ID),
            extent_id: get(props, PROP_EXTENT_ID),
            target_extent_id: get(props, PROP_TARGET_EXTENT_ID),
            iscsi_lun: parse_u32(props, PROP_ISCSI_LUN),
            subsystem_id: get(props, PROP_SUBSYSTEM_ID),
            subsystem_nqn: get(props, PROP_SUBSYSTEM_NQN),
            namespace_id: get(props, PROP_NAMESPACE_ID),
            namespace_nsid: parse_u32(props, PROP_NAMESPACE_NSID),
        },
        adoption: AdoptionMeta {
            pvc_name: get(props, PROP_PVC_NAME),
            pvc_namespace: get(props, PROP_PVC_NAMESPACE),
            storage_class: get(props, PROP_STORAGE_CLASS),
            adoptable: parse_bool(props, PROP_ADOPTABLE),
        },
        source_volume: get(props, PROP_SOURCE_VOLUME),
        origin_snapshot: get(props, PROP_ORIGIN_SNAPSHOT),
        created_at: parse_time(props, PROP_CREATED_AT),
    })
}

/// Properties tagged onto a snapshot (native) or its copy dataset
/// (detached).
pub fn snapshot_properties(record: &SnapshotRecord, instance: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    insert(&mut map, PROP_MANAGED_BY, instance);
    insert(&mut map, PROP_SCHEMA_VERSION, SCHEMA_VERSION);
    insert(&mut map, PROP_SNAPSHOT_NAME, &record.name);
    insert(&mut map, PROP_SOURCE_VOLUME, &record.source_volume);
    insert(&mut map, PROP_SOURCE_DATASET, &record.source_dataset);
    insert(&mut map, PROP_PROTOCOL, &record.protocol.to_string());
    if record.detached {
        insert(&mut map, PROP_DETACHED, "true");
    }
    if let Some(created_at) = record.created_at {
        insert(&mut map, PROP_CREATED_AT, &created_at.to_rfc3339());
    }
    map
}

/// Reconstruct a detached snapshot record from its copy dataset.
pub fn detached_snapshot_record(ds: &Dataset, instance: &str) -> Option<SnapshotRecord> {
    let props = &ds.user_properties;
    if get(props, PROP_MANAGED_BY).as_deref() != Some(instance)
        || !parse_bool(props, PROP_DETACHED)
    {
        return None;
    }
    Some(SnapshotRecord {
        name: get(props, PROP_SNAPSHOT_NAME)?,
        source_volume: get(props, PROP_SOURCE_VOLUME)?,
        source_dataset: get(props, PROP_SOURCE_DATASET).unwrap_or_default(),
        protocol: Protocol::from_str(&get(props, PROP_PROTOCOL)?).ok()?,
        detached: true,
        created_at: parse_time(props, PROP_CREATED_AT),
    })
}

/// Reconstruct a native snapshot record from snapshot properties.
pub fn native_snapshot_record(info: &SnapshotInfo, instance: &str) -> Option<SnapshotRecord> {
    let props = &info.user_properties;
    if get(props, PROP_MANAGED_BY).as_deref() != Some(instance) {
        return None;
    }
    Some(SnapshotRecord {
        name: info.name.clone(),
        source_volume: get(props, PROP_SOURCE_VOLUME)?,
        source_dataset: info.dataset.clone(),
        protocol: Protocol::from_str(&get(props, PROP_PROTOCOL)?).ok()?,
        detached: false,
        created_at: Some(info.created_at),
    })
}

/// Build the orchestrator-facing context map for a volume: everything
/// a node needs to publish or mount it, with no further engine calls.
pub fn context_map(
    record: &VolumeRecord,
    cfg: &EngineConfig,
) -> ZnasResult<HashMap<String, String>> {
    let mut map = HashMap::new();
    insert(&mut map, context::DATASET, &record.dataset);
    insert(&mut map, context::PROTOCOL, &record.protocol.to_string());
    match record.protocol {
        Protocol::Nfs => {
            let nfs = cfg.nfs.as_ref().ok_or_else(|| {
                ZnasError::Engine(
                    ErrorEnum::Busy,
                    "NFS exposure is not configured".to_string(),
                )
            })?;
            insert(&mut map, context::NFS_SERVER, &nfs.server);
            insert(&mut map, context::NFS_EXPORT, &names::mount_path(&record.dataset));
        }
        Protocol::Iscsi => {
            let iscsi = cfg.iscsi.as_ref().ok_or_else(|| {
                ZnasError::Engine(
                    ErrorEnum::Busy,
                    "iSCSI exposure is not configured".to_string(),
                )
            })?;
            insert(&mut map, context::ISCSI_PORTAL, &iscsi.portal);
            insert(
                &mut map,
                context::ISCSI_IQN,
                &names::iqn(&iscsi.iqn_base, &record.name),
            );
            insert(
                &mut map,
                context::ISCSI_LUN,
                &record.handles.iscsi_lun.unwrap_or(0).to_string(),
            );
        }
        Protocol::Nvmeof => {
            let nvmeof = cfg.nvmeof.as_ref().ok_or_else(|| {
                ZnasError::Engine(
                    ErrorEnum::Busy,
                    "NVMe-oF exposure is not configured".to_string(),
                )
            })?;
            insert(&mut map, context::NVMEOF_ADDRESS, &nvmeof.transport_address);
            let nqn = record
                .handles
                .subsystem_nqn
                .clone()
                .unwrap_or_else(|| names::nqn(&nvmeof.nqn_base, &record.name));
            insert(&mut map, context::NVMEOF_NQN, &nqn);
            if let Some(nsid) = record.handles.namespace_nsid {
                insert(&mut map, context::NVMEOF_NSID, &nsid.to_string());
            }
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use chrono::SubsecRound;

    use super::*;
    use crate::engine::appliance::DatasetKind;

    fn record() -> VolumeRecord {
        VolumeRecord {
            name: Name::new("pvc-1".to_string()),
            protocol: Protocol::Iscsi,
            dataset: "tank/volumes/pvc-1".to_string(),
            capacity_bytes: Some(1 << 30),
            delete_strategy: DeleteStrategy::Retain,
            handles: ExposureHandles {
                target_id: Some("t-1".to_string()),
                extent_id: Some("e-1".to_string()),
                target_extent_id: Some("te-1".to_string()),
                iscsi_lun: Some(0),
                ..ExposureHandles::default()
            },
            adoption: AdoptionMeta {
                pvc_name: Some("data".to_string()),
                pvc_namespace: Some("apps".to_string()),
                storage_class: Some("fast".to_string()),
                adoptable: true,
            },
            source_volume: None,
            origin_snapshot: Some("base".to_string()),
            created_at: Some(Utc::now().trunc_subsecs(0)),
        }
    }

    fn dataset_with(props: HashMap<String, String>) -> Dataset {
        Dataset {
            name: "tank/volumes/pvc-1".to_string(),
            kind: DatasetKind::Volume,
            capacity_bytes: Some(1 << 30),
            origin: None,
            user_properties: props,
        }
    }

    #[test]
    /// A volume record survives the round trip through its property
    /// map with every field intact.
    fn volume_record_round_trip() {
        let record = record();
        let props = volume_properties(&record, "znas");
        let recovered = volume_record_from_dataset(&dataset_with(props), "znas").unwrap();
        assert_eq!(recovered, record);
    }

    #[test]
    /// A dataset with another owner's marker, or no marker at all, is
    /// not ours.
    fn foreign_marker_is_not_found() {
        let props = volume_properties(&record(), "someone-else");
        assert_eq!(
            volume_record_from_dataset(&dataset_with(props), "znas"),
            None
        );
        assert_eq!(
            volume_record_from_dataset(&dataset_with(HashMap::new()), "znas"),
            None
        );
    }

    #[test]
    /// An unparseable capacity property decodes to None rather than
    /// poisoning the record; None compares as compatible on create.
    fn unparseable_capacity_is_none() {
        let mut props = volume_properties(&record(), "znas");
        props.insert(PROP_CAPACITY.to_string(), "lots".to_string());
        let recovered = volume_record_from_dataset(&dataset_with(props), "znas").unwrap();
        assert_eq!(recovered.capacity_bytes, None);
    }

    #[test]
    /// Detached snapshot records round-trip through dataset properties.
    fn detached_snapshot_round_trip() {
        let snap = SnapshotRecord {
            name: "s1".to_string(),
            source_volume: "pvc-1".to_string(),
            source_dataset: "tank/volumes/pvc-1".to_string(),
            protocol: Protocol::Nfs,
            detached: true,
            created_at: Some(Utc::now().trunc_subsecs(0)),
        };
        let props = snapshot_properties(&snap, "znas");
        let mut ds = dataset_with(props);
        ds.name = "tank/snapshots/s1".to_string();
        assert_eq!(detached_snapshot_record(&ds, "znas").unwrap(), snap);
    }

    #[test]
    /// The context map for an NFS volume carries the server and export
    /// path a node mounts from.
    fn nfs_context() {
        let mut record = record();
        record.protocol = Protocol::Nfs;
        let map = context_map(&record, &EngineConfig::default()).unwrap();
        assert_eq!(map.get(context::NFS_SERVER).unwrap(), "127.0.0.1");
        assert_eq!(
            map.get(context::NFS_EXPORT).unwrap(),
            "/mnt/tank/volumes/pvc-1"
        );
    }
}
