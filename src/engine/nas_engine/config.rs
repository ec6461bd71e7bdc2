// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::time::Duration;

use serde_derive::Deserialize;

use crate::{
    engine::nas_engine::names,
    znas::{ErrorEnum, ZnasError, ZnasResult},
};

fn default_instance() -> String {
    "znas".to_string()
}

fn default_replication_poll_ms() -> u64 {
    2000
}

fn default_iqn_base() -> String {
    "iqn.2004-04.io.znas".to_string()
}

fn default_nqn_base() -> String {
    "nqn.2004-04.io.znas".to_string()
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct NfsConfig {
    /// Host nodes mount NFS exports from.
    pub server: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct IscsiConfig {
    /// `host:port` nodes log in to.
    pub portal: String,
    #[serde(default = "default_iqn_base")]
    pub iqn_base: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct NvmeofConfig {
    /// `host:port` of the fabric transport.
    pub transport_address: String,
    #[serde(default = "default_nqn_base")]
    pub nqn_base: String,
}

/// Engine configuration. This is the engine's entire in-process state
/// besides the client handle; everything else lives on the appliance.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Value written to the managed-by marker property. Datasets whose
    /// marker carries a different value belong to another owner and are
    /// treated as not found.
    #[serde(default = "default_instance")]
    pub instance: String,
    /// Parent dataset under which volume datasets are created.
    pub parent_dataset: String,
    /// Parent dataset under which detached snapshot copies are created.
    pub detached_parent_dataset: String,
    /// Create zvols sparse.
    #[serde(default)]
    pub sparse_volumes: bool,
    #[serde(default = "default_replication_poll_ms")]
    pub replication_poll_ms: u64,
    #[serde(default)]
    pub nfs: Option<NfsConfig>,
    #[serde(default)]
    pub iscsi: Option<IscsiConfig>,
    #[serde(default)]
    pub nvmeof: Option<NvmeofConfig>,
}

impl EngineConfig {
    pub fn validate(&self) -> ZnasResult<()> {
        if self.instance.is_empty() {
            return Err(ZnasError::Engine(
                ErrorEnum::Invalid,
                "instance marker must not be empty".to_string(),
            ));
        }
        for (field, value) in [
            ("parent_dataset", &self.parent_dataset),
            ("detached_parent_dataset", &self.detached_parent_dataset),
        ] {
            if value.is_empty() || value.starts_with('/') || value.ends_with('/') {
                return Err(ZnasError::Engine(
                    ErrorEnum::Invalid,
                    format!("{field} {value:?} is not a dataset path"),
                ));
            }
        }
        if self.parent_dataset == self.detached_parent_dataset {
            return Err(ZnasError::Engine(
                ErrorEnum::Invalid,
                "volume and detached snapshot parents must be distinct datasets".to_string(),
            ));
        }
        Ok(())
    }

    pub fn replication_poll(&self) -> Duration {
        Duration::from_millis(self.replication_poll_ms)
    }

    /// Backing dataset path for a volume name.
    pub fn volume_dataset(&self, name: &str) -> String {
        names::dataset_path(&self.parent_dataset, name)
    }

    /// Dataset path holding a detached snapshot copy.
    pub fn detached_dataset(&self, snapshot: &str) -> String {
        names::dataset_path(&self.detached_parent_dataset, snapshot)
    }
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            instance: default_instance(),
            parent_dataset: "tank/volumes".to_string(),
            detached_parent_dataset: "tank/snapshots".to_string(),
            sparse_volumes: false,
            replication_poll_ms: default_replication_poll_ms(),
            nfs: Some(NfsConfig {
                server: "127.0.0.1".to_string(),
            }),
            iscsi: Some(IscsiConfig {
                portal: "127.0.0.1:3260".to_string(),
                iqn_base: default_iqn_base(),
            }),
            nvmeof: Some(NvmeofConfig {
                transport_address: "127.0.0.1:4420".to_string(),
                nqn_base: default_nqn_base(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::znas::{ErrorEnum, ZnasError};

    #[test]
    /// The default configuration passes validation.
    fn default_is_valid() {
        assert_matches!(EngineConfig::default().validate(), Ok(()));
    }

    #[test]
    /// Empty or slash-delimited parents are rejected.
    fn bad_parent_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.parent_dataset = String::new();
        assert_matches!(
            cfg.validate(),
            Err(ZnasError::Engine(ErrorEnum::Invalid, _))
        );
        cfg.parent_dataset = "/tank/volumes".to_string();
        assert_matches!(
            cfg.validate(),
            Err(ZnasError::Engine(ErrorEnum::Invalid, _))
        );
    }

    #[test]
    /// The volume parent and detached snapshot parent may not collide;
    /// snapshot names and volume names share one namespace otherwise.
    fn colliding_parents_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.detached_parent_dataset = cfg.parent_dataset.clone();
        assert_matches!(
            cfg.validate(),
            Err(ZnasError::Engine(ErrorEnum::Invalid, _))
        );
    }

    #[test]
    /// Configuration deserializes from JSON with defaults applied.
    fn deserialize_with_defaults() {
        let cfg: EngineConfig = serde_json::from_str(
            r#"{
                "parent_dataset": "tank/csi/v",
                "detached_parent_dataset": "tank/csi/s",
                "nfs": {"server": "nas.example.net"}
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.instance, "znas");
        assert_eq!(cfg.replication_poll_ms, 2000);
        assert_eq!(cfg.nfs.unwrap().server, "nas.example.net");
        assert_eq!(cfg.iscsi, None);
    }
}
