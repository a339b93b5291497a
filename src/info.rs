/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! `.decsync-info` at the share root and the per-instance local info file.

use log::warn;
use serde_json::{json, Map, Value};

use crate::error::{DecsyncError, Result};
use crate::file::DecsyncFile;

/// Highest on-disk format version this implementation can read and write.
pub const SUPPORTED_VERSION: i64 = 2;

const DECSYNC_INFO_FILENAME: &str = "decsync-info";
const LOCAL_INFO_FILENAME: &str = "info";

pub(crate) fn decsync_info_file(decsync_dir: &DecsyncFile) -> DecsyncFile {
    decsync_dir.hidden_child(DECSYNC_INFO_FILENAME)
}

/// Reads the `.decsync-info` object, creating it with the default
/// `{"version": 1}` when absent.
pub(crate) fn get_decsync_info(decsync_dir: &DecsyncFile) -> Result<Map<String, Value>> {
    let file = decsync_info_file(decsync_dir);
    let lines = file.read_lines(0).map_err(DecsyncError::from_io)?;
    if lines.is_empty() {
        let mut default = Map::new();
        default.insert("version".to_owned(), json!(1));
        file.write_text(&Value::Object(default.clone()).to_string())
            .map_err(DecsyncError::from_io)?;
        return Ok(default);
    }
    let text = lines.join("\n");
    match serde_json::from_str(&text) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(other) => Err(DecsyncError::InvalidInfo(format!(
            "expected an object, got {}",
            other
        ))),
        Err(err) => Err(DecsyncError::InvalidInfo(err.to_string())),
    }
}

/// Extracts and validates the `version` of a `.decsync-info` object.
pub(crate) fn info_version(info: &Map<String, Value>) -> Result<i64> {
    let version = info
        .get("version")
        .and_then(Value::as_i64)
        .ok_or_else(|| DecsyncError::InvalidInfo("missing integer 'version'".to_owned()))?;
    if !(1..=SUPPORTED_VERSION).contains(&version) {
        return Err(DecsyncError::UnsupportedVersion {
            found: version,
            supported: SUPPORTED_VERSION,
        });
    }
    Ok(version)
}

/// The dispatcher's own bookkeeping under the opaque `localDir`: `version`,
/// `last-active` and `supported-version`. Corrupt content is discarded.
pub(crate) struct LocalInfo {
    file: DecsyncFile,
    values: Map<String, Value>,
}

impl LocalInfo {
    pub fn load(local_dir: &DecsyncFile) -> LocalInfo {
        let file = local_dir.child(LOCAL_INFO_FILENAME);
        let values = match file.read_lines(0) {
            Ok(lines) if lines.is_empty() => Map::new(),
            Ok(lines) => match serde_json::from_str(&lines.join("\n")) {
                Ok(Value::Object(object)) => object,
                _ => {
                    warn!("discarding corrupt local info '{}'", file.display());
                    Map::new()
                }
            },
            Err(err) => {
                warn!("failed to read local info '{}': {}", file.display(), err);
                Map::new()
            }
        };
        LocalInfo { file, values }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.values.get(key).and_then(Value::as_i64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn put(&mut self, key: &str, value: Value) -> std::io::Result<()> {
        self.values.insert(key.to_owned(), value);
        self.file.write_text(&Value::Object(self.values.clone()).to_string())
    }
}
