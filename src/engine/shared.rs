// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::sync::LazyLock;

use regex::Regex;

use crate::{
    engine::types::{Protocol, SnapshotRecord, VolumeRecord},
    znas::{ErrorEnum, ZnasError, ZnasResult},
};

// Orchestrator-assigned names become dataset path components and
// protocol object names, so they are held to the common DNS-label
// subset rather than the full range ZFS would accept.
static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9._-]*[a-z0-9])?$").expect("regex is statically valid")
});

/// Validate an orchestrator-assigned volume or snapshot name.
pub fn validate_name(name: &str) -> ZnasResult<()> {
    if name.is_empty() {
        return Err(ZnasError::Engine(
            ErrorEnum::Invalid,
            "Name must not be empty".to_string(),
        ));
    }
    // Leave room for parent path prefixes within the ZFS name limit.
    if name.len() > 200 {
        return Err(ZnasError::Engine(
            ErrorEnum::Invalid,
            format!("Name has more than 200 characters : {name}"),
        ));
    }
    if !NAME_RE.is_match(name) {
        return Err(ZnasError::Engine(
            ErrorEnum::Invalid,
            format!("Name contains characters outside [a-z0-9._-] : {name}"),
        ));
    }
    Ok(())
}

/// Called when the name of a requested volume coincides with the name
/// of an existing managed volume. Returns an error if the request is
/// incompatible with the existing volume, otherwise `Ok(())`, meaning
/// the create is treated as an identity operation.
///
/// An existing volume whose recorded capacity is unknown compares as
/// compatible. This deliberately weakens the idempotency guarantee to
/// keep volumes created before capacity was recorded usable. A
/// requested capacity of zero means "unspecified" (clone requests
/// inherit the source size) and is likewise compatible.
pub fn create_volume_idempotent_or_err(
    existing: &VolumeRecord,
    protocol: Protocol,
    requested_bytes: u64,
) -> ZnasResult<()> {
    if existing.protocol != protocol {
        return Err(ZnasError::Engine(
            ErrorEnum::AlreadyExists,
            format!(
                "volume {} already exists with protocol {}, requested {}",
                existing.name, existing.protocol, protocol
            ),
        ));
    }
    match existing.capacity_bytes {
        None => Ok(()),
        _ if requested_bytes == 0 => Ok(()),
        Some(capacity) if capacity == requested_bytes => Ok(()),
        Some(capacity) => Err(ZnasError::Engine(
            ErrorEnum::AlreadyExists,
            format!(
                "volume {} already exists with capacity {capacity}, requested {requested_bytes}",
                existing.name
            ),
        )),
    }
}

/// Called when the name of a requested snapshot coincides with an
/// existing managed snapshot.
pub fn create_snapshot_idempotent_or_err(
    existing: &SnapshotRecord,
    source_volume: &str,
    detached: bool,
) -> ZnasResult<()> {
    if existing.source_volume != source_volume {
        return Err(ZnasError::Engine(
            ErrorEnum::AlreadyExists,
            format!(
                "snapshot {} already exists for volume {}, requested for {source_volume}",
                existing.name, existing.source_volume
            ),
        ));
    }
    if existing.detached != detached {
        return Err(ZnasError::Engine(
            ErrorEnum::AlreadyExists,
            format!(
                "snapshot {} already exists with detached={}, requested detached={detached}",
                existing.name, existing.detached
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::engine::types::{
        AdoptionMeta, DeleteStrategy, ExposureHandles, Name,
    };

    fn existing(capacity_bytes: Option<u64>) -> VolumeRecord {
        VolumeRecord {
            name: Name::new("pvc-1".to_string()),
            protocol: Protocol::Nfs,
            dataset: "tank/volumes/pvc-1".to_string(),
            capacity_bytes,
            delete_strategy: DeleteStrategy::Delete,
            handles: ExposureHandles::default(),
            adoption: AdoptionMeta::default(),
            source_volume: None,
            origin_snapshot: None,
            created_at: None,
        }
    }

    #[test]
    pub fn test_validate_name() {
        assert!(validate_name("").is_err());
        assert!(validate_name("UPPER").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("-leading-dash").is_err());
        assert!(validate_name("trailing-dash-").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("name@snap").is_err());
        assert!(validate_name(&"x".repeat(201)).is_err());

        assert!(validate_name("pvc-8f14e45f").is_ok());
        assert!(validate_name("a").is_ok());
        assert!(validate_name("data.volume_1").is_ok());
        assert!(validate_name(&"x".repeat(200)).is_ok());
    }

    #[test]
    /// Equal capacity is compatible.
    fn capacity_equal_compatible() {
        assert_matches!(
            create_volume_idempotent_or_err(&existing(Some(1024)), Protocol::Nfs, 1024),
            Ok(())
        );
    }

    #[test]
    /// Unknown existing capacity is compatible by design.
    fn capacity_unknown_compatible() {
        assert_matches!(
            create_volume_idempotent_or_err(&existing(None), Protocol::Nfs, 1024),
            Ok(())
        );
    }

    #[test]
    /// A zero (unspecified) requested capacity is compatible with any
    /// recorded capacity.
    fn capacity_unspecified_compatible() {
        assert_matches!(
            create_volume_idempotent_or_err(&existing(Some(2048)), Protocol::Nfs, 0),
            Ok(())
        );
    }

    #[test]
    /// Differing capacity is an incompatible name collision.
    fn capacity_mismatch_rejected() {
        assert_matches!(
            create_volume_idempotent_or_err(&existing(Some(2048)), Protocol::Nfs, 1024),
            Err(ZnasError::Engine(ErrorEnum::AlreadyExists, _))
        );
    }

    #[test]
    /// A protocol change is an incompatible name collision even at the
    /// same capacity.
    fn protocol_mismatch_rejected() {
        assert_matches!(
            create_volume_idempotent_or_err(&existing(Some(1024)), Protocol::Iscsi, 1024),
            Err(ZnasError::Engine(ErrorEnum::AlreadyExists, _))
        );
    }

    #[test]
    /// A snapshot name reused against a different source volume is a
    /// collision.
    fn snapshot_source_mismatch_rejected() {
        let snap = SnapshotRecord {
            name: "s1".to_string(),
            source_volume: "pvc-1".to_string(),
            source_dataset: "tank/volumes/pvc-1".to_string(),
            protocol: Protocol::Nfs,
            detached: false,
            created_at: None,
        };
        assert_matches!(
            create_snapshot_idempotent_or_err(&snap, "pvc-1", false),
            Ok(())
        );
        assert_matches!(
            create_snapshot_idempotent_or_err(&snap, "pvc-2", false),
            Err(ZnasError::Engine(ErrorEnum::AlreadyExists, _))
        );
        assert_matches!(
            create_snapshot_idempotent_or_err(&snap, "pvc-1", true),
            Err(ZnasError::Engine(ErrorEnum::AlreadyExists, _))
        );
    }
}
