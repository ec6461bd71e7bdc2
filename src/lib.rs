// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! znasd: a volume lifecycle engine that maps orchestrator-driven
//! volume and snapshot requests onto a remote ZFS storage appliance,
//! exposing volumes over NFS, iSCSI, and NVMe-oF.

pub mod engine;
pub mod znas;
