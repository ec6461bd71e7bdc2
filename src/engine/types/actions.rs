// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Contains types which encode the results of actions requested on the
//! engine. Each action type is designed to support idempotency: the
//! action completed successfully, and the type indicates what changes
//! had to be made. Create-like actions carry the resource in both
//! variants because a retried create must hand back the identifiers of
//! the earlier success, not newly minted ones.

use std::fmt::{self, Display};

use crate::engine::types::{Expansion, Name, ProvisionedSnapshot, ProvisionedVolume};

/// A trait for a generic kind of action. Defines the type of the thing
/// to be changed, and also a method to indicate what changed.
pub trait EngineAction {
    type Return;

    /// Returns whether or not the action changed state.
    fn is_changed(&self) -> bool;

    /// Returns the thing or things changed.
    fn changed(self) -> Option<Self::Return>;
}

#[derive(Debug, PartialEq, Eq)]
/// A single create action.
pub enum CreateAction<T> {
    /// The thing already existed; the carried value describes it as found.
    Identity(T),
    /// The thing did not already exist and was created.
    Created(T),
}

impl<T> CreateAction<T> {
    /// The resource, whether it was created by this call or discovered.
    pub fn into_inner(self) -> T {
        match self {
            CreateAction::Identity(t) | CreateAction::Created(t) => t,
        }
    }
}

impl<T> EngineAction for CreateAction<T> {
    type Return = T;

    fn is_changed(&self) -> bool {
        matches!(*self, CreateAction::Created(_))
    }

    fn changed(self) -> Option<T> {
        match self {
            CreateAction::Created(t) => Some(t),
            _ => None,
        }
    }
}

impl Display for CreateAction<ProvisionedVolume> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreateAction::Created(vol) => {
                write!(
                    f,
                    "Volume {} was created successfully on dataset {}",
                    vol.name, vol.dataset
                )
            }
            CreateAction::Identity(vol) => {
                write!(
                    f,
                    "The volume {} requested for creation is already present; no action taken",
                    vol.name
                )
            }
        }
    }
}

impl Display for CreateAction<ProvisionedSnapshot> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreateAction::Created(snap) => {
                write!(f, "Snapshot {} was created successfully", snap.snapshot_id)
            }
            CreateAction::Identity(snap) => {
                write!(
                    f,
                    "The snapshot {} requested for creation is already present; no action taken",
                    snap.snapshot_id
                )
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
/// A single delete action.
pub enum DeleteAction<T> {
    /// The thing was already gone.
    Identity,
    /// The thing existed and was removed.
    Deleted(T),
}

impl<T> EngineAction for DeleteAction<T> {
    type Return = T;

    fn is_changed(&self) -> bool {
        matches!(*self, DeleteAction::Deleted(_))
    }

    fn changed(self) -> Option<T> {
        match self {
            DeleteAction::Deleted(t) => Some(t),
            _ => None,
        }
    }
}

impl Display for DeleteAction<Name> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeleteAction::Deleted(name) => {
                write!(f, "Volume {name} was deleted successfully")
            }
            DeleteAction::Identity => {
                write!(
                    f,
                    "The volume requested for deletion is already absent; no action taken"
                )
            }
        }
    }
}

impl Display for DeleteAction<String> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeleteAction::Deleted(id) => {
                write!(f, "Snapshot {id} was deleted successfully")
            }
            DeleteAction::Identity => {
                write!(
                    f,
                    "The snapshot requested for deletion is already absent; no action taken"
                )
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
/// An action which may grow a single thing.
pub enum GrowAction<T> {
    /// The thing was already at least the requested size.
    Identity(T),
    /// The thing was grown to the requested size.
    Grown(T),
}

impl<T> GrowAction<T> {
    pub fn into_inner(self) -> T {
        match self {
            GrowAction::Identity(t) | GrowAction::Grown(t) => t,
        }
    }
}

impl<T> EngineAction for GrowAction<T> {
    type Return = T;

    fn is_changed(&self) -> bool {
        matches!(*self, GrowAction::Grown(_))
    }

    fn changed(self) -> Option<T> {
        match self {
            GrowAction::Grown(t) => Some(t),
            _ => None,
        }
    }
}

impl Display for GrowAction<Expansion> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrowAction::Grown(exp) => {
                write!(
                    f,
                    "Volume was expanded successfully to {} bytes",
                    exp.capacity_bytes
                )
            }
            GrowAction::Identity(exp) => {
                write!(
                    f,
                    "The volume is already at least {} bytes; no action taken",
                    exp.capacity_bytes
                )
            }
        }
    }
}
