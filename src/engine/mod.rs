// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

pub use self::{
    engine::Engine,
    nas_engine::{EngineConfig, IscsiConfig, NasEngine, NfsConfig, NvmeofConfig},
    shared::{
        create_snapshot_idempotent_or_err, create_volume_idempotent_or_err, validate_name,
    },
    types::{
        params, AdoptionMeta, CloneMode, CreateAction, CreateSnapshotRequest,
        CreateVolumeRequest, DeleteAction, DeleteStrategy, EngineAction, Expansion,
        ExposureHandles, GrowAction, Name, Protocol, ProvisionedSnapshot, ProvisionedVolume,
        SnapshotFilter, SnapshotPage, SnapshotRecord, VolumeParams, VolumeRecord,
    },
};

pub mod appliance;
#[allow(clippy::module_inception)]
mod engine;
mod nas_engine;
mod shared;
mod types;
