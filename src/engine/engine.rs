// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::fmt::Debug;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    engine::types::{
        CreateAction, CreateSnapshotRequest, CreateVolumeRequest, DeleteAction, Expansion,
        GrowAction, Name, ProvisionedSnapshot, ProvisionedVolume, SnapshotFilter, SnapshotPage,
    },
    znas::ZnasResult,
};

/// The volume lifecycle interface exposed to the protocol server.
///
/// The engine holds no state between calls; every operation rediscovers
/// prior state from the appliance, which makes each of them safe to
/// retry an unbounded number of times. A retried create returns the
/// identifiers of the earlier success, a retried delete of something
/// already gone is an identity operation.
#[async_trait]
pub trait Engine: Debug + Send + Sync {
    /// Provision a volume and its protocol exposure chain.
    /// Returns `Identity` if a compatible volume of this name already
    /// exists; errors with `AlreadyExists` if the name is taken with a
    /// different protocol or a different recorded capacity.
    async fn create_volume(
        &self,
        request: &CreateVolumeRequest,
    ) -> ZnasResult<CreateAction<ProvisionedVolume>>;

    /// Provision a volume whose dataset is materialized from a
    /// snapshot, under the clone mode named in the request parameters.
    /// Restoring from a detached snapshot ignores the clone mode: the
    /// restored volume always depends on the backup.
    async fn create_volume_from_snapshot(
        &self,
        request: &CreateVolumeRequest,
        snapshot_id: &str,
    ) -> ZnasResult<CreateAction<ProvisionedVolume>>;

    /// Provision a volume cloned from another volume, via a transient
    /// snapshot of the source.
    async fn create_volume_from_volume(
        &self,
        request: &CreateVolumeRequest,
        source_volume_id: &str,
    ) -> ZnasResult<CreateAction<ProvisionedVolume>>;

    /// Tear down a volume's exposure objects and, unless its delete
    /// strategy is `retain`, its backing dataset.
    /// Ensures the volume is absent on completion; an absent volume is
    /// `Identity`, not an error.
    async fn delete_volume(&self, volume_id: &str) -> ZnasResult<DeleteAction<Name>>;

    /// Grow a volume to at least the requested capacity. A request at
    /// or below the recorded capacity is `Identity`. Absent volumes
    /// are an error here, unlike delete.
    async fn expand_volume(
        &self,
        volume_id: &str,
        new_capacity_bytes: u64,
    ) -> ZnasResult<GrowAction<Expansion>>;

    /// Create a native or detached snapshot of a volume, per the
    /// request parameters.
    async fn create_snapshot(
        &self,
        request: &CreateSnapshotRequest,
    ) -> ZnasResult<CreateAction<ProvisionedSnapshot>>;

    /// Destroy a snapshot; for detached snapshots this destroys the
    /// copy dataset. Fails `Busy` while a dependent clone exists.
    async fn delete_snapshot(&self, snapshot_id: &str) -> ZnasResult<DeleteAction<String>>;

    /// List managed snapshots, native and detached, with optional
    /// filtering and token-based pagination.
    async fn list_snapshots(&self, filter: &SnapshotFilter) -> ZnasResult<SnapshotPage>;

    /// A JSON report of every managed volume and snapshot, for
    /// operator inspection.
    async fn engine_state_report(&self) -> ZnasResult<Value>;
}
