// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Property-based discovery: finding volumes and snapshots by querying
//! the appliance, never a local cache. A dataset that exists but does
//! not carry this instance's managed-by marker is not-found, not an
//! error; the appliance is the only durable record of state and other
//! owners' datasets are none of our business.

use log::debug;

use crate::{
    engine::{
        appliance::{ApplianceClient, Dataset},
        nas_engine::{config::EngineConfig, names::SnapshotParts, props},
        types::{SnapshotRecord, VolumeRecord},
    },
    znas::ZnasResult,
};

/// Find a managed volume by name: property search first, then direct
/// lookup under the configured parent dataset.
pub async fn find_volume(
    client: &dyn ApplianceClient,
    cfg: &EngineConfig,
    name: &str,
) -> ZnasResult<Option<VolumeRecord>> {
    for ds in client
        .find_datasets_by_property(props::PROP_VOLUME_NAME, name)
        .await?
    {
        if let Some(record) = props::volume_record_from_dataset(&ds, &cfg.instance) {
            return Ok(Some(record));
        }
    }
    // Some appliances answer property searches only for natively
    // indexed properties; fall back to the name-derived path.
    let path = cfg.volume_dataset(name);
    match client.get_dataset(&path).await? {
        Some(ds) => {
            let record = props::volume_record_from_dataset(&ds, &cfg.instance);
            if record.is_none() {
                debug!("dataset {path} exists but is not managed by {}", cfg.instance);
            }
            Ok(record)
        }
        None => Ok(None),
    }
}

/// Look up the raw dataset at a volume's path, managed or not. Used to
/// distinguish adoption candidates from name collisions.
pub async fn probe_dataset(
    client: &dyn ApplianceClient,
    cfg: &EngineConfig,
    name: &str,
) -> ZnasResult<Option<Dataset>> {
    client.get_dataset(&cfg.volume_dataset(name)).await
}

/// Find a snapshot from its decoded identifier fragment, routing on
/// the detached flag.
pub async fn find_snapshot(
    client: &dyn ApplianceClient,
    cfg: &EngineConfig,
    parts: &SnapshotParts,
) -> ZnasResult<Option<SnapshotRecord>> {
    if parts.detached {
        return find_detached_snapshot(client, cfg, parts).await;
    }
    // A native snapshot lives on its source volume's dataset.
    let volume = match find_volume(client, cfg, &parts.volume).await? {
        Some(volume) => volume,
        None => return Ok(None),
    };
    match client.get_snapshot(&volume.dataset, &parts.snapshot).await? {
        Some(info) => Ok(Some(SnapshotRecord {
            name: info.name.clone(),
            source_volume: volume.name.to_owned(),
            source_dataset: volume.dataset.clone(),
            protocol: volume.protocol,
            detached: false,
            created_at: Some(info.created_at),
        })),
        None => Ok(None),
    }
}

async fn find_detached_snapshot(
    client: &dyn ApplianceClient,
    cfg: &EngineConfig,
    parts: &SnapshotParts,
) -> ZnasResult<Option<SnapshotRecord>> {
    for ds in client
        .find_datasets_by_property(props::PROP_SNAPSHOT_NAME, &parts.snapshot)
        .await?
    {
        if let Some(record) = props::detached_snapshot_record(&ds, &cfg.instance) {
            if record.source_volume == parts.volume {
                return Ok(Some(record));
            }
        }
    }
    match client.get_dataset(&cfg.detached_dataset(&parts.snapshot)).await? {
        Some(ds) => Ok(props::detached_snapshot_record(&ds, &cfg.instance)
            .filter(|record| record.source_volume == parts.volume)),
        None => Ok(None),
    }
}

/// Every volume managed by this instance.
pub async fn list_volumes(
    client: &dyn ApplianceClient,
    cfg: &EngineConfig,
) -> ZnasResult<Vec<VolumeRecord>> {
    Ok(client
        .find_datasets_by_property(props::PROP_MANAGED_BY, &cfg.instance)
        .await?
        .iter()
        .filter_map(|ds| props::volume_record_from_dataset(ds, &cfg.instance))
        .collect())
}

/// Managed native snapshots, optionally restricted to one source
/// volume. Transient snapshots (replication transfers, restore
/// origins) carry no marker and are excluded.
pub async fn list_native_snapshots(
    client: &dyn ApplianceClient,
    cfg: &EngineConfig,
    source_dataset: Option<&str>,
) -> ZnasResult<Vec<SnapshotRecord>> {
    Ok(client
        .list_snapshots(source_dataset)
        .await?
        .iter()
        .filter_map(|info| props::native_snapshot_record(info, &cfg.instance))
        .collect())
}

/// Managed detached snapshots, optionally restricted to one source
/// volume name.
pub async fn list_detached_snapshots(
    client: &dyn ApplianceClient,
    cfg: &EngineConfig,
    source_volume: Option<&str>,
) -> ZnasResult<Vec<SnapshotRecord>> {
    Ok(client
        .find_datasets_by_property(props::PROP_DETACHED, "true")
        .await?
        .iter()
        .filter_map(|ds| props::detached_snapshot_record(ds, &cfg.instance))
        .filter(|record| source_volume.is_none_or(|v| record.source_volume == v))
        .collect())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::engine::{
        appliance::{DatasetKind, DatasetSpec, SimAppliance},
        types::{
            AdoptionMeta, DeleteStrategy, ExposureHandles, Name, Protocol,
        },
    };

    use super::*;

    fn record(name: &str, cfg: &EngineConfig) -> VolumeRecord {
        VolumeRecord {
            name: Name::new(name.to_string()),
            protocol: Protocol::Nfs,
            dataset: cfg.volume_dataset(name),
            capacity_bytes: Some(1 << 30),
            delete_strategy: DeleteStrategy::Delete,
            handles: ExposureHandles::default(),
            adoption: AdoptionMeta::default(),
            source_volume: None,
            origin_snapshot: None,
            created_at: None,
        }
    }

    async fn managed_dataset(sim: &SimAppliance, cfg: &EngineConfig, name: &str) {
        let record = record(name, cfg);
        sim.create_dataset(&DatasetSpec {
            name: record.dataset.clone(),
            kind: DatasetKind::Filesystem,
            capacity_bytes: Some(1 << 30),
            sparse: false,
            properties: props::volume_properties(&record, &cfg.instance),
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    /// A marked dataset is found by property search and reconstructed
    /// in full.
    async fn finds_managed_volume() {
        let sim = SimAppliance::new();
        let cfg = EngineConfig::default();
        managed_dataset(&sim, &cfg, "pvc-1").await;
        let found = find_volume(&sim, &cfg, "pvc-1").await.unwrap().unwrap();
        assert_eq!(found, record("pvc-1", &cfg));
    }

    #[tokio::test]
    /// A dataset at the right path without our marker is not-found,
    /// not an error.
    async fn unmanaged_dataset_is_not_found() {
        let sim = SimAppliance::new();
        let cfg = EngineConfig::default();
        sim.create_dataset(&DatasetSpec {
            name: cfg.volume_dataset("pvc-1"),
            kind: DatasetKind::Filesystem,
            capacity_bytes: None,
            sparse: false,
            properties: HashMap::new(),
        })
        .await
        .unwrap();
        assert_eq!(find_volume(&sim, &cfg, "pvc-1").await.unwrap(), None);
        // The raw probe still sees it, for collision handling.
        assert!(probe_dataset(&sim, &cfg, "pvc-1").await.unwrap().is_some());
    }

    #[tokio::test]
    /// A marker written by a different engine instance is another
    /// owner; the volume is not ours.
    async fn foreign_owner_is_not_found() {
        let sim = SimAppliance::new();
        let other = EngineConfig {
            instance: "other".to_string(),
            ..EngineConfig::default()
        };
        managed_dataset(&sim, &other, "pvc-1").await;
        let cfg = EngineConfig::default();
        assert_eq!(find_volume(&sim, &cfg, "pvc-1").await.unwrap(), None);
    }

    #[tokio::test]
    /// Unmarked snapshots are invisible to listing; marked ones are
    /// returned.
    async fn listing_skips_transients() {
        let sim = SimAppliance::new();
        let cfg = EngineConfig::default();
        managed_dataset(&sim, &cfg, "pvc-1").await;
        let dataset = cfg.volume_dataset("pvc-1");
        sim.create_snapshot(&dataset, "s1").await.unwrap();
        let snap = SnapshotRecord {
            name: "s1".to_string(),
            source_volume: "pvc-1".to_string(),
            source_dataset: dataset.clone(),
            protocol: Protocol::Nfs,
            detached: false,
            created_at: None,
        };
        sim.set_snapshot_properties(
            &dataset,
            "s1",
            &props::snapshot_properties(&snap, &cfg.instance),
        )
        .await
        .unwrap();
        sim.create_snapshot(&dataset, "s1-xfer").await.unwrap();

        let listed = list_native_snapshots(&sim, &cfg, None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "s1");
    }
}
