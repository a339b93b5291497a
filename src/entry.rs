/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The entry data model and the conflict-resolution rule.
//!
//! An entry is serialized on the wire as `[datetime, key, value]`, an entry
//! with its path as `[[segments…], datetime, key, value]`, one JSON record
//! per line.

use std::cmp::Ordering;

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An immutable `(datetime, key, value)` triple. The datetime is a local
/// ISO-8601 second stamp whose lexicographic order is the causality token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "(String, Value, Value)", into = "(String, Value, Value)")]
pub struct Entry {
    pub datetime: String,
    pub key: Value,
    pub value: Value,
}

impl From<(String, Value, Value)> for Entry {
    fn from((datetime, key, value): (String, Value, Value)) -> Entry {
        Entry {
            datetime,
            key,
            value,
        }
    }
}

impl From<Entry> for (String, Value, Value) {
    fn from(entry: Entry) -> (String, Value, Value) {
        (entry.datetime, entry.key, entry.value)
    }
}

impl Entry {
    /// New entry stamped with the current local time.
    pub fn new(key: Value, value: Value) -> Entry {
        Entry {
            datetime: Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
            key,
            value,
        }
    }

    pub fn with_datetime(datetime: &str, key: Value, value: Value) -> Entry {
        Entry {
            datetime: datetime.to_owned(),
            key,
            value,
        }
    }

    /// Deterministic identity of the key, usable as a map key
    /// (`serde_json::Value` itself is not hashable).
    pub fn key_id(&self) -> String {
        self.key.to_string()
    }

    /// Last-writer-wins: a greater datetime supersedes, equal datetimes are
    /// broken by the lexicographic order of the serialized values. With
    /// `require_new_value` an unchanged value is not worth a new record even
    /// under a greater datetime; the write path sets it, the read-path merge
    /// does not.
    pub fn supersedes(&self, stored: &Entry, require_new_value: bool) -> bool {
        match self.datetime.cmp(&stored.datetime) {
            Ordering::Greater => !(require_new_value && self.value == stored.value),
            Ordering::Equal => self.value.to_string() > stored.value.to_string(),
            Ordering::Less => false,
        }
    }
}

/// Engine-side delivery callback: hands a batch of entries for one path to
/// the dispatcher and reports whether the receiver accepted them.
pub(crate) type Deliver<'a> = &'a mut dyn FnMut(&[String], &[Entry]) -> bool;

/// An entry together with the path it lives under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    from = "(Vec<String>, String, Value, Value)",
    into = "(Vec<String>, String, Value, Value)"
)]
pub struct EntryWithPath {
    pub path: Vec<String>,
    pub entry: Entry,
}

impl From<(Vec<String>, String, Value, Value)> for EntryWithPath {
    fn from((path, datetime, key, value): (Vec<String>, String, Value, Value)) -> EntryWithPath {
        EntryWithPath {
            path,
            entry: Entry {
                datetime,
                key,
                value,
            },
        }
    }
}

impl From<EntryWithPath> for (Vec<String>, String, Value, Value) {
    fn from(entry: EntryWithPath) -> (Vec<String>, String, Value, Value) {
        (
            entry.path,
            entry.entry.datetime,
            entry.entry.key,
            entry.entry.value,
        )
    }
}

impl EntryWithPath {
    pub fn new(path: &[String], entry: Entry) -> EntryWithPath {
        EntryWithPath {
            path: path.to_vec(),
            entry,
        }
    }
}

/// Identity of an entry without its value.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub path: Vec<String>,
    pub key: Value,
}

impl StoredEntry {
    pub fn new(path: &[String], key: Value) -> StoredEntry {
        StoredEntry {
            path: path.to_vec(),
            key,
        }
    }
}

/// Per-peer summary reported by `get_active_apps`.
#[derive(Debug, Clone, PartialEq)]
pub struct AppData {
    pub app_id: String,
    pub last_active: Option<String>,
    pub version: i64,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn entry(datetime: &str, value: Value) -> Entry {
        Entry::with_datetime(datetime, json!("k"), value)
    }

    #[test]
    fn test_entry_wire_format() {
        let entry = Entry::with_datetime("2020-08-23T00:00:00", json!("key"), json!({"a": 1}));
        let line = serde_json::to_string(&entry).unwrap();
        assert_eq!(r#"["2020-08-23T00:00:00","key",{"a":1}]"#, line);
        assert_eq!(entry, serde_json::from_str(&line).unwrap());
    }

    #[test]
    fn test_entry_with_path_wire_format() {
        let entry = EntryWithPath::new(
            &["a".to_owned(), "b".to_owned()],
            Entry::with_datetime("2020-08-23T00:00:00", json!(null), json!("v")),
        );
        let line = serde_json::to_string(&entry).unwrap();
        assert_eq!(r#"[["a","b"],"2020-08-23T00:00:00",null,"v"]"#, line);
        assert_eq!(entry, serde_json::from_str(&line).unwrap());
    }

    #[test]
    fn test_newer_datetime_supersedes() {
        let old = entry("2020-01-01T00:00:00", json!("a"));
        let new = entry("2020-01-02T00:00:00", json!("b"));
        assert!(new.supersedes(&old, false));
        assert!(new.supersedes(&old, true));
        assert!(!old.supersedes(&new, false));
    }

    #[test]
    fn test_equal_value_requires_new_value() {
        let old = entry("2020-01-01T00:00:00", json!("a"));
        let new = entry("2020-01-02T00:00:00", json!("a"));
        assert!(new.supersedes(&old, false));
        assert!(!new.supersedes(&old, true));
    }

    #[test]
    fn test_equal_datetime_breaks_ties_on_value() {
        let smaller = entry("2020-01-01T00:00:00", json!("a"));
        let larger = entry("2020-01-01T00:00:00", json!("b"));
        assert!(larger.supersedes(&smaller, false));
        assert!(larger.supersedes(&smaller, true));
        assert!(!smaller.supersedes(&larger, false));
    }

    #[test]
    fn test_identical_entry_never_supersedes() {
        let first = entry("2020-01-01T00:00:00", json!("a"));
        let second = entry("2020-01-01T00:00:00", json!("a"));
        assert!(!second.supersedes(&first, false));
        assert!(!second.supersedes(&first, true));
    }
}
