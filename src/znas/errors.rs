// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{error::Error, fmt};

pub type ZnasResult<T> = Result<T, ZnasError>;

/// Classification of engine-level errors.
///
/// `Busy` is returned when an operation is blocked by a standing
/// dependency or by missing exposure infrastructure, i.e. the failed
/// precondition may clear without any change to the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorEnum {
    Error,

    AlreadyExists,
    Busy,
    Invalid,
    NotFound,
}

#[derive(Debug)]
pub enum ZnasError {
    Error(String),
    Engine(ErrorEnum, String),
    Serde(serde_json::error::Error),
}

impl ZnasError {
    pub fn kind(&self) -> ErrorEnum {
        match *self {
            ZnasError::Engine(kind, _) => kind,
            ZnasError::Error(_) | ZnasError::Serde(_) => ErrorEnum::Error,
        }
    }
}

impl fmt::Display for ZnasError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ZnasError::Error(ref s) => write!(f, "Error: {s}"),
            ZnasError::Engine(_, ref msg) => write!(f, "Engine error: {msg}"),
            ZnasError::Serde(ref err) => write!(f, "Serde error: {err}"),
        }
    }
}

impl Error for ZnasError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match *self {
            ZnasError::Error(_) | ZnasError::Engine(_, _) => None,
            ZnasError::Serde(ref err) => Some(err),
        }
    }
}

impl From<serde_json::error::Error> for ZnasError {
    fn from(err: serde_json::error::Error) -> ZnasError {
        ZnasError::Serde(err)
    }
}
