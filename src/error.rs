/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DecsyncError>;

#[derive(Error, Debug)]
pub enum DecsyncError {
    /// The `.decsync-info` file exists but is not a JSON object with an
    /// integer `version`.
    #[error("invalid .decsync-info: {0}")]
    InvalidInfo(String),
    #[error("unsupported DecSync version {found} (supported up to {supported})")]
    UnsupportedVersion { found: i64, supported: i64 },
    #[error("insufficient access to the DecSync directory")]
    InsufficientAccess,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DecsyncError {
    pub(crate) fn from_io(err: std::io::Error) -> DecsyncError {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            DecsyncError::InsufficientAccess
        } else {
            DecsyncError::Io(err)
        }
    }
}
