// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Dataset path construction and the volume/snapshot identifier codec.
//
// Identifiers are the opaque strings handed to the orchestrator. They
// deliberately omit the full dataset path: the path is re-derived at
// use time from the configured parent dataset or recovered by property
// lookup. Both encoders enforce the orchestrator's byte-length ceiling
// for opaque IDs.

use std::str::FromStr;

use crate::{
    engine::types::Protocol,
    znas::{ErrorEnum, ZnasError, ZnasResult},
};

/// Ceiling the orchestrator guarantees for opaque identifiers.
pub const MAX_ID_BYTES: usize = 128;

/// Marks a snapshot identifier as referring to a detached copy.
const DETACHED_PREFIX: &str = "detached:";

/// Decoded form of a volume identifier. Intentionally partial: the
/// dataset path must be completed by discovery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeParts {
    pub protocol: Protocol,
    pub volume: String,
}

/// Decoded form of a snapshot identifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotParts {
    pub protocol: Protocol,
    pub volume: String,
    pub snapshot: String,
    pub detached: bool,
}

pub fn dataset_path(parent: &str, name: &str) -> String {
    format!("{parent}/{name}")
}

/// Mountpoint of a dataset on the appliance, which is also the NFS
/// export path.
pub fn mount_path(dataset: &str) -> String {
    format!("/mnt/{dataset}")
}

/// Block-device node for a zvol on the appliance.
pub fn zvol_device_path(dataset: &str) -> String {
    format!("/dev/zvol/{dataset}")
}

/// NVMe qualified name for a volume's subsystem.
pub fn nqn(base: &str, volume: &str) -> String {
    format!("{base}:{volume}")
}

/// iSCSI qualified name for a volume's target.
pub fn iqn(base: &str, volume: &str) -> String {
    format!("{base}:{volume}")
}

fn check_token(token: &str, what: &str) -> ZnasResult<()> {
    if token.is_empty() {
        return Err(ZnasError::Engine(
            ErrorEnum::Invalid,
            format!("{what} must not be empty"),
        ));
    }
    if token.contains(':') || token.contains('@') {
        return Err(ZnasError::Engine(
            ErrorEnum::Invalid,
            format!("{what} {token} contains a reserved separator"),
        ));
    }
    Ok(())
}

fn check_length(id: String) -> ZnasResult<String> {
    if id.len() > MAX_ID_BYTES {
        return Err(ZnasError::Engine(
            ErrorEnum::Invalid,
            format!(
                "identifier {id} is {} bytes, over the {MAX_ID_BYTES} byte ceiling",
                id.len()
            ),
        ));
    }
    Ok(id)
}

pub fn encode_volume_id(protocol: Protocol, volume: &str) -> ZnasResult<String> {
    check_token(volume, "volume name")?;
    check_length(format!("{protocol}:{volume}"))
}

pub fn decode_volume_id(id: &str) -> ZnasResult<VolumeParts> {
    let (protocol, volume) = id.split_once(':').ok_or_else(|| {
        ZnasError::Engine(
            ErrorEnum::Invalid,
            format!("volume id {id} has no protocol separator"),
        )
    })?;
    let protocol = Protocol::from_str(protocol).map_err(|_| {
        ZnasError::Engine(
            ErrorEnum::Invalid,
            format!("volume id {id} names unknown protocol {protocol}"),
        )
    })?;
    check_token(volume, "volume name")?;
    Ok(VolumeParts {
        protocol,
        volume: volume.to_string(),
    })
}

pub fn encode_snapshot_id(
    protocol: Protocol,
    volume: &str,
    snapshot: &str,
    detached: bool,
) -> ZnasResult<String> {
    check_token(volume, "source volume name")?;
    check_token(snapshot, "snapshot name")?;
    let prefix = if detached { DETACHED_PREFIX } else { "" };
    check_length(format!("{prefix}{protocol}:{volume}@{snapshot}"))
}

pub fn decode_snapshot_id(id: &str) -> ZnasResult<SnapshotParts> {
    let (detached, rest) = match id.strip_prefix(DETACHED_PREFIX) {
        Some(rest) => (true, rest),
        None => (false, id),
    };
    let (protocol, rest) = rest.split_once(':').ok_or_else(|| {
        ZnasError::Engine(
            ErrorEnum::Invalid,
            format!("snapshot id {id} has no protocol separator"),
        )
    })?;
    let protocol = Protocol::from_str(protocol).map_err(|_| {
        ZnasError::Engine(
            ErrorEnum::Invalid,
            format!("snapshot id {id} names unknown protocol {protocol}"),
        )
    })?;
    let (volume, snapshot) = rest.split_once('@').ok_or_else(|| {
        ZnasError::Engine(
            ErrorEnum::Invalid,
            format!("snapshot id {id} has no snapshot separator"),
        )
    })?;
    check_token(volume, "source volume name")?;
    check_token(snapshot, "snapshot name")?;
    Ok(SnapshotParts {
        protocol,
        volume: volume.to_string(),
        snapshot: snapshot.to_string(),
        detached,
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    use super::*;
    use crate::znas::{ErrorEnum, ZnasError};

    proptest! {
        #[test]
        /// Encoding then decoding a snapshot id recovers the protocol,
        /// source volume, snapshot name, and detached flag.
        fn snapshot_id_round_trip(
            volume in "[a-z0-9][a-z0-9-]{0,40}",
            snapshot in "[a-z0-9][a-z0-9-]{0,40}",
            detached in any::<bool>(),
        ) {
            for protocol in [Protocol::Nfs, Protocol::Iscsi, Protocol::Nvmeof] {
                let id = encode_snapshot_id(protocol, &volume, &snapshot, detached).unwrap();
                prop_assert!(id.len() <= MAX_ID_BYTES);
                let parts = decode_snapshot_id(&id).unwrap();
                prop_assert_eq!(parts.protocol, protocol);
                prop_assert_eq!(&parts.volume, &volume);
                prop_assert_eq!(&parts.snapshot, &snapshot);
                prop_assert_eq!(parts.detached, detached);
            }
        }

        #[test]
        /// Volume ids round-trip as well.
        fn volume_id_round_trip(volume in "[a-z0-9][a-z0-9-]{0,40}") {
            let id = encode_volume_id(Protocol::Iscsi, &volume).unwrap();
            let parts = decode_volume_id(&id).unwrap();
            prop_assert_eq!(parts.protocol, Protocol::Iscsi);
            prop_assert_eq!(parts.volume, volume);
        }
    }

    #[test]
    /// Empty tokens are rejected at encode time, never defaulted.
    fn encode_rejects_empty() {
        assert_matches!(
            encode_snapshot_id(Protocol::Nfs, "", "s1", false),
            Err(ZnasError::Engine(ErrorEnum::Invalid, _))
        );
        assert_matches!(
            encode_snapshot_id(Protocol::Nfs, "v1", "", false),
            Err(ZnasError::Engine(ErrorEnum::Invalid, _))
        );
        assert_matches!(
            encode_volume_id(Protocol::Nfs, ""),
            Err(ZnasError::Engine(ErrorEnum::Invalid, _))
        );
    }

    #[test]
    /// Tokens containing the reserved separators are rejected.
    fn encode_rejects_separators() {
        assert_matches!(
            encode_snapshot_id(Protocol::Nfs, "v@1", "s1", false),
            Err(ZnasError::Engine(ErrorEnum::Invalid, _))
        );
        assert_matches!(
            encode_snapshot_id(Protocol::Nfs, "v1", "s:1", false),
            Err(ZnasError::Engine(ErrorEnum::Invalid, _))
        );
    }

    #[test]
    /// Identifiers over the byte ceiling fail to encode.
    fn encode_rejects_oversize() {
        let long = "x".repeat(MAX_ID_BYTES);
        assert_matches!(
            encode_volume_id(Protocol::Nfs, &long),
            Err(ZnasError::Engine(ErrorEnum::Invalid, _))
        );
    }

    #[test]
    /// Malformed ids are rejected with Invalid, including unknown
    /// protocol tokens and missing separators.
    fn decode_rejects_malformed() {
        assert_matches!(
            decode_snapshot_id("v1-s1"),
            Err(ZnasError::Engine(ErrorEnum::Invalid, _))
        );
        assert_matches!(
            decode_snapshot_id("smb:v1@s1"),
            Err(ZnasError::Engine(ErrorEnum::Invalid, _))
        );
        assert_matches!(
            decode_snapshot_id("nfs:v1"),
            Err(ZnasError::Engine(ErrorEnum::Invalid, _))
        );
        assert_matches!(
            decode_snapshot_id("nfs:@s1"),
            Err(ZnasError::Engine(ErrorEnum::Invalid, _))
        );
        assert_matches!(
            decode_volume_id("pvc-1234"),
            Err(ZnasError::Engine(ErrorEnum::Invalid, _))
        );
    }

    #[test]
    /// The detached prefix survives a round trip and is not confused
    /// with a protocol token.
    fn detached_prefix() {
        let id = encode_snapshot_id(Protocol::Iscsi, "v1", "s1", true).unwrap();
        assert_eq!(id, "detached:iscsi:v1@s1");
        let parts = decode_snapshot_id(&id).unwrap();
        assert!(parts.detached);
        assert!(!decode_snapshot_id("iscsi:v1@s1").unwrap().detached);
    }
}
