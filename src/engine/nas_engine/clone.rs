// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The snapshot/clone dependency engine: one handler per clone mode,
//! detached snapshot creation over the replication mechanism, and the
//! restore path for detached snapshots.
//!
//! Dependency directions, by mode:
//! - `Cow`: clone -> snapshot -> source dataset. The snapshot cannot
//!   be destroyed while the clone exists.
//! - `Promoted`: the origin lineage is transferred to the clone; the
//!   former source depends on the clone.
//! - `Detached`: a full copy via a one-time replication job; no
//!   dependency in either direction.

use std::{collections::HashMap, time::Duration};

use log::{debug, warn};
use tokio::time::sleep;

use crate::{
    engine::{
        appliance::{ApplianceClient, Dataset, ReplicationJob, ReplicationState, SnapshotInfo},
        nas_engine::config::EngineConfig,
        types::CloneMode,
    },
    znas::{ErrorEnum, ZnasError, ZnasResult},
};

/// Suffix of the transient snapshot driving a detached copy.
const TRANSFER_SUFFIX: &str = "-xfer";

/// Everything needed to materialize a dataset from a snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloneParams {
    pub source_dataset: String,
    pub snapshot: String,
    pub mode: CloneMode,
}

/// Create the named snapshot if it does not already exist. Loses the
/// appliance-side race gracefully: "already exists" is re-queried and
/// returned.
pub async fn ensure_snapshot(
    client: &dyn ApplianceClient,
    dataset: &str,
    name: &str,
) -> ZnasResult<SnapshotInfo> {
    if let Some(info) = client.get_snapshot(dataset, name).await? {
        return Ok(info);
    }
    match client.create_snapshot(dataset, name).await {
        Ok(info) => Ok(info),
        Err(ZnasError::Engine(ErrorEnum::AlreadyExists, _)) => client
            .get_snapshot(dataset, name)
            .await?
            .ok_or_else(|| {
                ZnasError::Error(format!(
                    "snapshot {dataset}@{name} reported existing but cannot be read"
                ))
            }),
        Err(err) => Err(err),
    }
}

/// Attempt to promote a dataset, downgrading failure to a log line.
/// The artifact is usable without promotion; only later deletion of
/// its origin may be blocked until an operator intervenes. "Not a
/// clone" is the normal outcome after replication and is not worth a
/// warning.
async fn promote_best_effort(client: &dyn ApplianceClient, dataset: &str) {
    match client.promote_dataset(dataset).await {
        Ok(()) => {}
        Err(ZnasError::Engine(ErrorEnum::Invalid, _)) => {
            debug!("dataset {dataset} needed no promotion");
        }
        Err(err) => warn!("promotion of dataset {dataset} failed: {err}"),
    }
}

/// Best-effort removal of a transient snapshot. Absence is fine; a
/// standing clone dependency means the snapshot is still someone's
/// origin and must stay.
pub async fn destroy_snapshot_best_effort(
    client: &dyn ApplianceClient,
    dataset: &str,
    name: &str,
) {
    match client.destroy_snapshot(dataset, name).await {
        Ok(()) => {}
        Err(ZnasError::Engine(ErrorEnum::NotFound, _)) => {}
        Err(ZnasError::Engine(ErrorEnum::Busy, _)) => {
            debug!("transient snapshot {dataset}@{name} still has dependents; keeping it");
        }
        Err(err) => warn!("cleanup of transient snapshot {dataset}@{name} failed: {err}"),
    }
}

/// Best-effort removal of a partially materialized dataset.
async fn destroy_dataset_best_effort(client: &dyn ApplianceClient, dataset: &str) {
    match client.destroy_dataset(dataset).await {
        Ok(()) => {}
        Err(ZnasError::Engine(ErrorEnum::NotFound, _)) => {}
        Err(err) => warn!("cleanup of partial dataset {dataset} failed: {err}"),
    }
}

/// Poll a replication job to its terminal state. Cancellation is
/// dropping this future; it only ever waits in `sleep`, so it aborts
/// promptly and leaves whatever partial appliance state existed for
/// the next retry's idempotency check to reconcile.
async fn await_replication(
    client: &dyn ApplianceClient,
    interval: Duration,
    job: &ReplicationJob,
) -> ZnasResult<()> {
    loop {
        match client.replication_state(job).await? {
            ReplicationState::Done => return Ok(()),
            ReplicationState::Failed(msg) => {
                return Err(ZnasError::Error(format!(
                    "replication job {} failed: {msg}",
                    job.id
                )))
            }
            ReplicationState::Running => sleep(interval).await,
        }
    }
}

/// Materialize `target` from the snapshot described by `params`,
/// according to its clone mode. Finding the target already present is
/// success: an earlier attempt got this far.
pub async fn materialize(
    client: &dyn ApplianceClient,
    cfg: &EngineConfig,
    target: &str,
    params: &CloneParams,
) -> ZnasResult<Dataset> {
    if let Some(ds) = client.get_dataset(target).await? {
        debug!("dataset {target} already materialized; reusing");
        return Ok(ds);
    }
    match params.mode {
        CloneMode::Cow => {
            client
                .clone_snapshot(&params.source_dataset, &params.snapshot, target)
                .await
        }
        CloneMode::Promoted => {
            client
                .clone_snapshot(&params.source_dataset, &params.snapshot, target)
                .await?;
            promote_best_effort(client, target).await;
            client.get_dataset(target).await?.ok_or_else(|| {
                ZnasError::Error(format!("cloned dataset {target} cannot be read back"))
            })
        }
        CloneMode::Detached => {
            let source = format!("{}@{}", params.source_dataset, params.snapshot);
            let job = client.start_replication(&source, target).await?;
            if let Err(err) = await_replication(client, cfg.replication_poll(), &job).await {
                destroy_dataset_best_effort(client, target).await;
                return Err(err);
            }
            promote_best_effort(client, target).await;
            client.get_dataset(target).await?.ok_or_else(|| {
                ZnasError::Error(format!("replicated dataset {target} cannot be read back"))
            })
        }
    }
}

/// Create a detached snapshot of a live volume: snapshot the source,
/// replicate the snapshot into an independent dataset under the
/// detached parent, sever any residual dependency, drop the transient
/// snapshot on both sides, and tag the destination so later
/// delete/list/restore operations route to dataset handling.
pub async fn create_detached_snapshot(
    client: &dyn ApplianceClient,
    cfg: &EngineConfig,
    source_dataset: &str,
    snapshot: &str,
    properties: &HashMap<String, String>,
) -> ZnasResult<Dataset> {
    let transient = format!("{snapshot}{TRANSFER_SUFFIX}");
    let target = cfg.detached_dataset(snapshot);
    if client.get_dataset(&target).await?.is_none() {
        ensure_snapshot(client, source_dataset, &transient).await?;
        let source = format!("{source_dataset}@{transient}");
        let job = client.start_replication(&source, &target).await?;
        if let Err(err) = await_replication(client, cfg.replication_poll(), &job).await {
            destroy_dataset_best_effort(client, &target).await;
            destroy_snapshot_best_effort(client, source_dataset, &transient).await;
            return Err(err);
        }
    }
    promote_best_effort(client, &target).await;
    destroy_snapshot_best_effort(client, source_dataset, &transient).await;
    destroy_snapshot_best_effort(client, &target, &transient).await;
    // Without its tags the copy is not discoverable as a snapshot, so
    // unlike the volume property write this one is fatal.
    if let Err(err) = client.set_properties(&target, properties).await {
        destroy_dataset_best_effort(client, &target).await;
        return Err(err);
    }
    client.get_dataset(&target).await?.ok_or_else(|| {
        ZnasError::Error(format!("detached snapshot dataset {target} cannot be read back"))
    })
}

/// Prepare the clone parameters for restoring a volume from a detached
/// snapshot. The backup is a dataset, not a native snapshot, so the
/// restore clones from a transient native snapshot created on it. The
/// clone is deliberately never promoted: the restored volume depends
/// on the backup, restores can be repeated and freely deleted, and the
/// backup persists until explicitly removed.
pub async fn detached_restore_params(
    client: &dyn ApplianceClient,
    cfg: &EngineConfig,
    snapshot: &str,
    target_volume: &str,
) -> ZnasResult<CloneParams> {
    let backup = cfg.detached_dataset(snapshot);
    let transient = format!("restore-{target_volume}");
    ensure_snapshot(client, &backup, &transient).await?;
    Ok(CloneParams {
        source_dataset: backup,
        snapshot: transient,
        mode: CloneMode::Cow,
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::engine::appliance::{DatasetKind, DatasetSpec, SimAppliance};

    fn cfg() -> EngineConfig {
        EngineConfig {
            replication_poll_ms: 1,
            ..EngineConfig::default()
        }
    }

    async fn source_with_snapshot(sim: &SimAppliance) {
        sim.create_dataset(&DatasetSpec {
            name: "tank/volumes/v1".to_string(),
            kind: DatasetKind::Filesystem,
            capacity_bytes: Some(1 << 30),
            sparse: false,
            properties: HashMap::new(),
        })
        .await
        .unwrap();
        sim.create_snapshot("tank/volumes/v1", "s1").await.unwrap();
    }

    #[tokio::test]
    /// A COW clone keeps its origin pointer; the snapshot stays pinned.
    async fn materialize_cow() {
        let sim = SimAppliance::new();
        source_with_snapshot(&sim).await;
        let params = CloneParams {
            source_dataset: "tank/volumes/v1".to_string(),
            snapshot: "s1".to_string(),
            mode: CloneMode::Cow,
        };
        let ds = materialize(&sim, &cfg(), "tank/volumes/v2", &params)
            .await
            .unwrap();
        assert_eq!(ds.origin.as_deref(), Some("tank/volumes/v1@s1"));
        assert_matches!(
            sim.destroy_snapshot("tank/volumes/v1", "s1").await,
            Err(ZnasError::Engine(ErrorEnum::Busy, _))
        );
    }

    #[tokio::test]
    /// A promoted clone sheds its origin pointer and the source becomes
    /// the dependent side.
    async fn materialize_promoted() {
        let sim = SimAppliance::new();
        source_with_snapshot(&sim).await;
        let params = CloneParams {
            source_dataset: "tank/volumes/v1".to_string(),
            snapshot: "s1".to_string(),
            mode: CloneMode::Promoted,
        };
        let ds = materialize(&sim, &cfg(), "tank/volumes/v2", &params)
            .await
            .unwrap();
        assert_eq!(ds.origin, None);
        assert_matches!(
            sim.destroy_dataset("tank/volumes/v2").await,
            Err(ZnasError::Engine(ErrorEnum::Busy, _))
        );
    }

    #[tokio::test]
    /// A detached clone has no dependency in either direction.
    async fn materialize_detached() {
        let sim = SimAppliance::new();
        source_with_snapshot(&sim).await;
        let params = CloneParams {
            source_dataset: "tank/volumes/v1".to_string(),
            snapshot: "s1".to_string(),
            mode: CloneMode::Detached,
        };
        let ds = materialize(&sim, &cfg(), "tank/volumes/v2", &params)
            .await
            .unwrap();
        assert_eq!(ds.origin, None);
        sim.destroy_dataset("tank/volumes/v1").await.unwrap();
        sim.destroy_dataset("tank/volumes/v2").await.unwrap();
    }

    #[tokio::test]
    /// Re-materializing an already materialized target is an identity
    /// operation, for retried sagas.
    async fn materialize_reuses_existing() {
        let sim = SimAppliance::new();
        source_with_snapshot(&sim).await;
        let params = CloneParams {
            source_dataset: "tank/volumes/v1".to_string(),
            snapshot: "s1".to_string(),
            mode: CloneMode::Cow,
        };
        materialize(&sim, &cfg(), "tank/volumes/v2", &params)
            .await
            .unwrap();
        let creations = sim.creation_count();
        materialize(&sim, &cfg(), "tank/volumes/v2", &params)
            .await
            .unwrap();
        assert_eq!(sim.creation_count(), creations);
    }

    #[tokio::test]
    /// Creating a detached snapshot leaves an independent, tagged copy
    /// and no transient snapshots on either side.
    async fn detached_snapshot_lifecycle() {
        let sim = SimAppliance::new();
        source_with_snapshot(&sim).await;
        let props = HashMap::from([("znas:detached_snapshot".to_string(), "true".to_string())]);
        let ds = create_detached_snapshot(&sim, &cfg(), "tank/volumes/v1", "backup-1", &props)
            .await
            .unwrap();
        assert_eq!(ds.name, "tank/snapshots/backup-1");
        assert_eq!(ds.origin, None);
        assert_eq!(
            ds.user_properties.get("znas:detached_snapshot").unwrap(),
            "true"
        );
        assert!(sim
            .get_snapshot("tank/volumes/v1", "backup-1-xfer")
            .await
            .unwrap()
            .is_none());
        assert!(sim
            .get_snapshot("tank/snapshots/backup-1", "backup-1-xfer")
            .await
            .unwrap()
            .is_none());
        // Both sides are independently destroyable.
        sim.destroy_dataset("tank/volumes/v1").await.unwrap();
        sim.destroy_dataset("tank/snapshots/backup-1").await.unwrap();
    }

    #[tokio::test]
    /// A failed replication job cleans up the partial copy dataset and
    /// the transient source snapshot, then surfaces the failure.
    async fn detached_snapshot_replication_failure() {
        let sim = SimAppliance::new();
        source_with_snapshot(&sim).await;
        sim.fail_replication(true);
        let result = create_detached_snapshot(
            &sim,
            &cfg(),
            "tank/volumes/v1",
            "backup-1",
            &HashMap::new(),
        )
        .await;
        assert_matches!(result, Err(_));
        assert!(sim
            .get_dataset("tank/snapshots/backup-1")
            .await
            .unwrap()
            .is_none());
        assert!(sim
            .get_snapshot("tank/volumes/v1", "backup-1-xfer")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    /// Restoring from a detached snapshot clones without promotion, so
    /// the restored dataset depends on the backup, not the reverse.
    async fn restore_depends_on_backup() {
        let sim = SimAppliance::new();
        source_with_snapshot(&sim).await;
        create_detached_snapshot(&sim, &cfg(), "tank/volumes/v1", "backup-1", &HashMap::new())
            .await
            .unwrap();
        let params = detached_restore_params(&sim, &cfg(), "backup-1", "v3")
            .await
            .unwrap();
        assert_eq!(params.mode, CloneMode::Cow);
        let ds = materialize(&sim, &cfg(), "tank/volumes/v3", &params)
            .await
            .unwrap();
        assert_eq!(
            ds.origin.as_deref(),
            Some("tank/snapshots/backup-1@restore-v3")
        );
        // The backup is pinned while the restore exists, and free once
        // it is gone.
        assert_matches!(
            sim.destroy_dataset("tank/snapshots/backup-1").await,
            Err(ZnasError::Engine(ErrorEnum::Busy, _))
        );
        sim.destroy_dataset("tank/volumes/v3").await.unwrap();
        sim.destroy_dataset("tank/snapshots/backup-1").await.unwrap();
    }
}
