// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    borrow::Borrow,
    collections::HashMap,
    fmt,
    ops::Deref,
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde_derive::Serialize;
use strum_macros::{Display, EnumString};

pub use crate::engine::types::actions::{
    CreateAction, DeleteAction, EngineAction, GrowAction,
};
use crate::{
    engine::appliance::DatasetKind,
    znas::{ErrorEnum, ZnasError, ZnasResult},
};

mod actions;

/// Parameter keys understood in orchestrator request parameter maps.
pub mod params {
    pub const DELETE_STRATEGY: &str = "deleteStrategy";
    pub const CLONE_MODE: &str = "cloneMode";
    pub const DETACHED: &str = "detached";
    pub const PVC_NAME: &str = "pvcName";
    pub const PVC_NAMESPACE: &str = "pvcNamespace";
    pub const STORAGE_CLASS: &str = "storageClassName";
    pub const ADOPTABLE: &str = "adoptable";
}

/// The wire protocol over which a volume is exposed to nodes.
#[derive(
    Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq, Serialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Nfs,
    Iscsi,
    Nvmeof,
}

impl Protocol {
    /// The kind of backing dataset the protocol requires.
    pub fn dataset_kind(self) -> DatasetKind {
        match self {
            Protocol::Nfs => DatasetKind::Filesystem,
            Protocol::Iscsi | Protocol::Nvmeof => DatasetKind::Volume,
        }
    }

    /// Block protocols require node-side filesystem expansion after a
    /// capacity change; NFS does not.
    pub fn is_block(self) -> bool {
        matches!(self, Protocol::Iscsi | Protocol::Nvmeof)
    }
}

/// What deleting a volume does to its backing dataset.
#[derive(
    Clone, Copy, Debug, Default, Display, EnumString, Eq, PartialEq, Serialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeleteStrategy {
    #[default]
    Delete,
    Retain,
}

/// Strategy used to materialize a volume from a snapshot.
///
/// A closed variant rather than independent boolean flags; exactly one
/// handler exists per mode.
#[derive(
    Clone, Copy, Debug, Default, Display, EnumString, Eq, PartialEq, Serialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CloneMode {
    /// Copy-on-write clone; depends on its origin snapshot.
    #[default]
    Cow,
    /// Clone then promote; the origin lineage depends on the clone.
    Promoted,
    /// Full data copy; no dependency in either direction.
    Detached,
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Serialize)]
pub struct Name(String);

impl Name {
    pub fn new(name: String) -> Name {
        Name(name)
    }

    pub fn to_owned(&self) -> String {
        self.0.clone()
    }
}

impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for Name {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Name {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Appliance-side handles for a volume's protocol exposure objects.
///
/// Only the handles belonging to the volume's protocol are set; all are
/// recorded as properties on the backing dataset.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ExposureHandles {
    pub share_id: Option<String>,
    pub target_id: Option<String>,
    pub extent_id: Option<String>,
    pub target_extent_id: Option<String>,
    pub iscsi_lun: Option<u32>,
    pub subsystem_id: Option<String>,
    pub subsystem_nqn: Option<String>,
    pub namespace_id: Option<String>,
    pub namespace_nsid: Option<u32>,
}

/// Orchestrator-side identity of the claim a volume was provisioned
/// for. Volumes carrying `adoptable = true` may be re-managed by a
/// rebuilt cluster.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct AdoptionMeta {
    pub pvc_name: Option<String>,
    pub pvc_namespace: Option<String>,
    pub storage_class: Option<String>,
    pub adoptable: bool,
}

/// The logical unit exposed to the orchestrator, reconstructed in full
/// from appliance-side properties.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VolumeRecord {
    pub name: Name,
    pub protocol: Protocol,
    pub dataset: String,
    /// Recorded capacity in bytes. `None` when the property is absent
    /// or unparseable, which compares as compatible on create.
    pub capacity_bytes: Option<u64>,
    pub delete_strategy: DeleteStrategy,
    pub handles: ExposureHandles,
    pub adoption: AdoptionMeta,
    pub source_volume: Option<String>,
    pub origin_snapshot: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// A point-in-time copy of a volume's dataset. When `detached` is true
/// the snapshot is itself an independent dataset produced by a full
/// data copy, and delete/list/restore route to dataset operations.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SnapshotRecord {
    pub name: String,
    pub source_volume: String,
    pub source_dataset: String,
    pub protocol: Protocol,
    pub detached: bool,
    pub created_at: Option<DateTime<Utc>>,
}

/// Per-volume parameters decoded from an orchestrator parameter map.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VolumeParams {
    pub delete_strategy: DeleteStrategy,
    pub clone_mode: CloneMode,
    pub adoption: AdoptionMeta,
}

impl VolumeParams {
    /// Decode the well-known parameter keys, rejecting malformed values.
    /// Unknown keys are ignored; the orchestrator forwards storage-class
    /// parameters that are not ours to police.
    pub fn from_parameters(parameters: &HashMap<String, String>) -> ZnasResult<VolumeParams> {
        let delete_strategy = match parameters.get(params::DELETE_STRATEGY) {
            Some(s) => DeleteStrategy::from_str(s).map_err(|_| {
                ZnasError::Engine(
                    ErrorEnum::Invalid,
                    format!("{s} is not a valid delete strategy"),
                )
            })?,
            None => DeleteStrategy::default(),
        };
        let clone_mode = match parameters.get(params::CLONE_MODE) {
            Some(s) => CloneMode::from_str(s).map_err(|_| {
                ZnasError::Engine(
                    ErrorEnum::Invalid,
                    format!("{s} is not a valid clone mode"),
                )
            })?,
            None => CloneMode::default(),
        };
        let adoption = AdoptionMeta {
            pvc_name: parameters.get(params::PVC_NAME).cloned(),
            pvc_namespace: parameters.get(params::PVC_NAMESPACE).cloned(),
            storage_class: parameters.get(params::STORAGE_CLASS).cloned(),
            adoptable: parse_bool_param(parameters, params::ADOPTABLE)?.unwrap_or(false),
        };
        Ok(VolumeParams {
            delete_strategy,
            clone_mode,
            adoption,
        })
    }
}

/// Parse a boolean request parameter, distinguishing "absent" from
/// "malformed".
pub fn parse_bool_param(
    parameters: &HashMap<String, String>,
    key: &str,
) -> ZnasResult<Option<bool>> {
    match parameters.get(key).map(|s| s.as_str()) {
        None => Ok(None),
        Some("true") => Ok(Some(true)),
        Some("false") => Ok(Some(false)),
        Some(other) => Err(ZnasError::Engine(
            ErrorEnum::Invalid,
            format!("{other} is not a valid value for parameter {key}"),
        )),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateVolumeRequest {
    pub name: String,
    pub protocol: Protocol,
    pub capacity_bytes: u64,
    pub parameters: HashMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateSnapshotRequest {
    pub name: String,
    pub source_volume_id: String,
    pub parameters: HashMap<String, String>,
}

/// A provisioned volume as reported back to the orchestrator. The
/// context map is the complete set of facts a node needs to publish or
/// mount the volume; the orchestrator never asks the engine anything
/// further.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProvisionedVolume {
    pub volume_id: String,
    pub name: Name,
    pub protocol: Protocol,
    pub dataset: String,
    pub capacity_bytes: u64,
    pub context: HashMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProvisionedSnapshot {
    pub snapshot_id: String,
    pub source_volume_id: String,
    pub created_at: DateTime<Utc>,
    pub ready: bool,
}

/// Result of a volume expansion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Expansion {
    pub capacity_bytes: u64,
    pub node_expansion_required: bool,
}

/// Filters and paging for snapshot listing. At most one of
/// `snapshot_id` and `source_volume_id` is honored; `snapshot_id` wins.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotFilter {
    pub snapshot_id: Option<String>,
    pub source_volume_id: Option<String>,
    pub page_size: Option<usize>,
    pub page_token: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotPage {
    pub entries: Vec<ProvisionedSnapshot>,
    pub next_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;
    use crate::znas::{ErrorEnum, ZnasError};

    #[test]
    /// Protocol tokens parse from their lowercase forms and display back
    /// to the same token.
    fn protocol_tokens_round_trip() {
        for (token, protocol) in [
            ("nfs", Protocol::Nfs),
            ("iscsi", Protocol::Iscsi),
            ("nvmeof", Protocol::Nvmeof),
        ] {
            assert_eq!(Protocol::from_str(token).unwrap(), protocol);
            assert_eq!(protocol.to_string(), token);
        }
        assert_matches!(Protocol::from_str("smb"), Err(_));
    }

    #[test]
    /// An empty parameter map decodes to the defaults.
    fn params_defaults() {
        let params = VolumeParams::from_parameters(&HashMap::new()).unwrap();
        assert_eq!(params.delete_strategy, DeleteStrategy::Delete);
        assert_eq!(params.clone_mode, CloneMode::Cow);
        assert!(!params.adoption.adoptable);
    }

    #[test]
    /// A malformed clone mode is rejected as invalid, not defaulted.
    fn params_bad_clone_mode() {
        let map = HashMap::from([(params::CLONE_MODE.to_string(), "shallow".to_string())]);
        assert_matches!(
            VolumeParams::from_parameters(&map),
            Err(ZnasError::Engine(ErrorEnum::Invalid, _))
        );
    }

    #[test]
    /// A malformed boolean parameter is rejected rather than read as
    /// false.
    fn params_bad_bool() {
        let map = HashMap::from([(params::ADOPTABLE.to_string(), "yes".to_string())]);
        assert_matches!(
            VolumeParams::from_parameters(&map),
            Err(ZnasError::Engine(ErrorEnum::Invalid, _))
        );
    }

    #[test]
    /// All parameter keys are honored when present and well formed.
    fn params_full() {
        let map = HashMap::from([
            (params::DELETE_STRATEGY.to_string(), "retain".to_string()),
            (params::CLONE_MODE.to_string(), "detached".to_string()),
            (params::PVC_NAME.to_string(), "data".to_string()),
            (params::PVC_NAMESPACE.to_string(), "apps".to_string()),
            (params::STORAGE_CLASS.to_string(), "fast".to_string()),
            (params::ADOPTABLE.to_string(), "true".to_string()),
        ]);
        let params = VolumeParams::from_parameters(&map).unwrap();
        assert_eq!(params.delete_strategy, DeleteStrategy::Retain);
        assert_eq!(params.clone_mode, CloneMode::Detached);
        assert_eq!(params.adoption.pvc_name.as_deref(), Some("data"));
        assert_eq!(params.adoption.pvc_namespace.as_deref(), Some("apps"));
        assert_eq!(params.adoption.storage_class.as_deref(), Some("fast"));
        assert!(params.adoption.adoptable);
    }
}
