// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

pub use self::{
    config::{EngineConfig, IscsiConfig, NfsConfig, NvmeofConfig},
    engine::NasEngine,
};

mod clone;
mod config;
mod discovery;
#[allow(clippy::module_inception)]
mod engine;
mod names;
mod props;
mod provision;
mod saga;
