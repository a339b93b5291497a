/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The version-2 engine: every appId keeps 256 hash-bucketed append logs of
//! entries-with-path plus a reserved `info` bucket, and a `sequences` object
//! whose per-bucket counters tell peers which buckets changed.

use std::collections::{BTreeMap, HashMap};

use log::warn;
use serde_json::{Map, Value};

use crate::entry::{Deliver, Entry, EntryWithPath, StoredEntry};
use crate::error::Result;
use crate::file::DecsyncFile;

const V2_DIR: &str = "v2";
const SEQUENCES_FILENAME: &str = "sequences";
const INFO_BUCKET: &str = "info";

pub(crate) fn v2_dir(subdir: &DecsyncFile) -> DecsyncFile {
    subdir.child(V2_DIR)
}

pub(crate) fn layout_exists(subdir: &DecsyncFile) -> bool {
    matches!(v2_dir(subdir).node(), crate::fs::FileNode::Directory)
}

/// Bucket of a path: the reserved `info` bucket for global info writes,
/// otherwise a rolling polynomial hash rendered as two lowercase hex chars.
/// The reservation keeps info writes from competing with hashed ones.
pub(crate) fn bucket(path: &[String]) -> String {
    if path.len() == 1 && path[0] == INFO_BUCKET {
        return INFO_BUCKET.to_owned();
    }
    let mut combined: u32 = 0;
    for segment in path {
        let mut hash: u32 = 0;
        for byte in segment.as_bytes() {
            hash = (hash * 19 + u32::from(*byte)) % 256;
        }
        combined = (combined * 199 + hash) % 256;
    }
    format!("{:02x}", combined)
}

/// Reads a single-line JSON object file, treating absence and corruption as
/// empty. A lost sequences object only forces a full re-read.
pub(crate) fn read_json_object(file: &DecsyncFile) -> Map<String, Value> {
    let lines = match file.read_lines(0) {
        Ok(lines) => lines,
        Err(err) => {
            warn!("failed to read '{}': {}", file.display(), err);
            return Map::new();
        }
    };
    if lines.is_empty() {
        return Map::new();
    }
    match serde_json::from_str(&lines.join("\n")) {
        Ok(Value::Object(object)) => object,
        _ => {
            warn!("treating corrupt object '{}' as empty", file.display());
            Map::new()
        }
    }
}

pub(crate) struct V2Engine {
    dir: DecsyncFile,
    local_dir: DecsyncFile,
    own_app_id: String,
}

impl V2Engine {
    pub fn new(subdir: &DecsyncFile, local_dir: DecsyncFile, own_app_id: &str) -> V2Engine {
        V2Engine {
            dir: v2_dir(subdir),
            local_dir,
            own_app_id: own_app_id.to_owned(),
        }
    }

    fn bucket_file(&self, app_id: &str, bucket: &str) -> DecsyncFile {
        self.dir.child(app_id).child(bucket)
    }

    fn sequences_file(&self, app_id: &str) -> DecsyncFile {
        self.dir.child(app_id).child(SEQUENCES_FILENAME)
    }

    pub fn set_entries(&self, entries: Vec<EntryWithPath>) -> Result<()> {
        let mut groups: HashMap<String, Vec<EntryWithPath>> = HashMap::new();
        for entry in entries {
            groups.entry(bucket(&entry.path)).or_default().push(entry);
        }
        let mut sequences = read_json_object(&self.sequences_file(&self.own_app_id));
        let mut changed = false;
        for (bucket, entries) in groups {
            let survivors = self.update_bucket(&bucket, entries, true)?;
            if !survivors.is_empty() {
                let next = sequences.get(&bucket).and_then(Value::as_i64).unwrap_or(0) + 1;
                sequences.insert(bucket, next.into());
                changed = true;
            }
        }
        if changed {
            self.sequences_file(&self.own_app_id)
                .write_text(&Value::Object(sequences).to_string())?;
        }
        Ok(())
    }

    /// Applies `entries` against the own log of one bucket and returns the
    /// entries that actually changed it.
    fn update_bucket(
        &self,
        bucket: &str,
        mut entries: Vec<EntryWithPath>,
        require_new_value: bool,
    ) -> std::io::Result<Vec<EntryWithPath>> {
        let file = self.bucket_file(&self.own_app_id, bucket);
        let mut stored: HashMap<(Vec<String>, String), EntryWithPath> = HashMap::new();
        for line in file.read_lines(0)? {
            match serde_json::from_str::<EntryWithPath>(&line) {
                Ok(entry) => {
                    let id = (entry.path.clone(), entry.entry.key_id());
                    match stored.get(&id) {
                        Some(known) if !entry.entry.supersedes(&known.entry, false) => {}
                        _ => {
                            stored.insert(id, entry);
                        }
                    }
                }
                Err(err) => warn!("skipping malformed row in '{}': {}", file.display(), err),
            }
        }

        let mut removed = false;
        entries.retain(|entry| {
            let id = (entry.path.clone(), entry.entry.key_id());
            match stored.get(&id) {
                None => true,
                Some(known) if entry.entry.supersedes(&known.entry, require_new_value) => {
                    stored.remove(&id);
                    removed = true;
                    true
                }
                Some(_) => false,
            }
        });
        if entries.is_empty() {
            return Ok(vec![]);
        }

        if removed {
            let lines: Vec<String> = stored
                .values()
                .map(|entry| serde_json::to_string(entry).unwrap())
                .collect();
            file.write_lines(&lines, false)?;
        }
        let lines: Vec<String> = entries
            .iter()
            .map(|entry| serde_json::to_string(entry).unwrap())
            .collect();
        file.write_lines(&lines, true)?;
        Ok(entries)
    }

    /// Scans every peer whose `sequences` object moved past the locally
    /// recorded state, merges the changed buckets into the own log and
    /// delivers the surviving entries grouped by path. Own sequences are not
    /// touched: peers track this instance through their own records.
    pub fn execute_all_new_entries(&self, deliver: Deliver) {
        self.dir.reset_cache();
        let record_file = self.local_dir.child(SEQUENCES_FILENAME);
        let mut record = read_json_object(&record_file);
        let mut record_changed = false;

        let mut apps: Vec<String> = self
            .dir
            .decoded_children()
            .into_iter()
            .map(|(name, _)| name)
            .filter(|name| *name != self.own_app_id)
            .collect();
        apps.sort();

        for app_id in apps {
            let peer_sequences = read_json_object(&self.sequences_file(&app_id));
            let mut seen = match record.get(&app_id) {
                Some(Value::Object(object)) => object.clone(),
                _ => Map::new(),
            };
            let mut seen_changed = false;
            for (bucket, value) in &peer_sequences {
                if seen.get(bucket) == Some(value) {
                    continue;
                }
                if self.execute_bucket(&app_id, bucket, &mut *deliver) {
                    seen.insert(bucket.clone(), value.clone());
                    seen_changed = true;
                }
            }
            if seen_changed {
                record.insert(app_id, Value::Object(seen));
                record_changed = true;
            }
        }

        if record_changed {
            if let Err(err) = record_file.write_text(&Value::Object(record).to_string()) {
                warn!("failed to record sequences '{}': {}", record_file.display(), err);
            }
        }
    }

    fn execute_bucket(&self, app_id: &str, bucket: &str, deliver: Deliver) -> bool {
        let file = self.bucket_file(app_id, bucket);
        let lines = match file.read_lines(0) {
            Ok(lines) => lines,
            Err(err) => {
                warn!("failed to read bucket '{}': {}", file.display(), err);
                return false;
            }
        };
        let mut entries = vec![];
        for line in lines {
            match serde_json::from_str::<EntryWithPath>(&line) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!("skipping malformed row in '{}': {}", file.display(), err),
            }
        }
        let survivors = match self.update_bucket(bucket, entries, false) {
            Ok(survivors) => survivors,
            Err(err) => {
                warn!("failed to merge bucket '{}': {}", file.display(), err);
                return false;
            }
        };

        let mut groups: BTreeMap<Vec<String>, Vec<Entry>> = BTreeMap::new();
        for entry in survivors {
            groups.entry(entry.path).or_default().push(entry.entry);
        }
        let mut success = true;
        for (path, entries) in groups {
            success &= deliver(&path, &entries);
        }
        success
    }

    fn own_buckets(&self) -> Vec<(String, DecsyncFile)> {
        self.dir
            .child(&self.own_app_id)
            .decoded_children()
            .into_iter()
            .filter(|(name, _)| name != SEQUENCES_FILENAME)
            .collect()
    }

    pub fn execute_stored_entries_for_path_exact(
        &self,
        path: &[String],
        keys: Option<&[Value]>,
        deliver: Deliver,
    ) -> bool {
        let file = self.bucket_file(&self.own_app_id, &bucket(path));
        let entries: Vec<Entry> = self
            .read_bucket_entries(&file)
            .into_iter()
            .filter(|entry| entry.path == path)
            .map(|entry| entry.entry)
            .filter(|entry| keys.map_or(true, |keys| keys.contains(&entry.key)))
            .collect();
        entries.is_empty() || deliver(path, &entries)
    }

    pub fn execute_stored_entries_for_path_prefix(
        &self,
        prefix: &[String],
        keys: Option<&[Value]>,
        deliver: Deliver,
    ) -> bool {
        // The hash does not preserve prefixes, so every bucket is scanned.
        let mut groups: BTreeMap<Vec<String>, Vec<Entry>> = BTreeMap::new();
        for (_, file) in self.own_buckets() {
            for entry in self.read_bucket_entries(&file) {
                if entry.path.starts_with(prefix)
                    && keys.map_or(true, |keys| keys.contains(&entry.entry.key))
                {
                    groups.entry(entry.path).or_default().push(entry.entry);
                }
            }
        }
        let mut success = true;
        for (path, entries) in groups {
            success &= deliver(&path, &entries);
        }
        success
    }

    pub fn execute_stored_entries(&self, stored: &[StoredEntry], deliver: Deliver) -> bool {
        let mut groups: HashMap<Vec<String>, Vec<Value>> = HashMap::new();
        for entry in stored {
            groups
                .entry(entry.path.clone())
                .or_default()
                .push(entry.key.clone());
        }
        let mut success = true;
        for (path, keys) in groups {
            success &=
                self.execute_stored_entries_for_path_exact(&path, Some(&keys), &mut *deliver);
        }
        success
    }

    fn read_bucket_entries(&self, file: &DecsyncFile) -> Vec<EntryWithPath> {
        let lines = match file.read_lines(0) {
            Ok(lines) => lines,
            Err(err) => {
                warn!("failed to read bucket '{}': {}", file.display(), err);
                return vec![];
            }
        };
        let mut entries = vec![];
        for line in lines {
            match serde_json::from_str::<EntryWithPath>(&line) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!("skipping malformed row in '{}': {}", file.display(), err),
            }
        }
        entries
    }

    pub fn latest_app_id(&self) -> String {
        let mut best_app = self.own_app_id.clone();
        let mut best_datetime: Option<String> = None;
        for (app_id, app_dir) in self.dir.decoded_children() {
            for (name, file) in app_dir.decoded_children() {
                if name == SEQUENCES_FILENAME {
                    continue;
                }
                for entry in self.read_bucket_entries(&file) {
                    let datetime = Some(entry.entry.datetime);
                    if datetime > best_datetime
                        || (datetime == best_datetime && app_id == self.own_app_id)
                    {
                        best_datetime = datetime;
                        best_app = app_id.clone();
                    }
                }
            }
        }
        best_app
    }
}

/// Merges the `["info"]` rows of every app's info bucket into `info`,
/// newest datetime per key winning.
pub(crate) fn collect_static_info(subdir: &DecsyncFile, info: &mut HashMap<String, Entry>) {
    for (_, app_dir) in v2_dir(subdir).decoded_children() {
        let file = app_dir.child(INFO_BUCKET);
        let lines = match file.read_lines(0) {
            Ok(lines) => lines,
            Err(err) => {
                warn!("failed to read '{}': {}", file.display(), err);
                continue;
            }
        };
        for line in lines {
            match serde_json::from_str::<EntryWithPath>(&line) {
                Ok(entry) if entry.path == [INFO_BUCKET] => {
                    let entry = entry.entry;
                    match info.get(&entry.key_id()) {
                        Some(known) if !entry.supersedes(known, false) => {}
                        _ => {
                            info.insert(entry.key_id(), entry);
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => warn!("skipping malformed row in '{}': {}", file.display(), err),
            }
        }
    }
}

/// All appIds visible in the version-2 layout.
pub(crate) fn app_ids(subdir: &DecsyncFile) -> std::collections::BTreeSet<String> {
    v2_dir(subdir)
        .decoded_children()
        .into_iter()
        .map(|(name, _)| name)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use crate::fs::memory::InMemoryFs;
    use crate::fs::{FileSystem, NativeFile};

    use super::*;

    fn subdir(fs: &Arc<InMemoryFs>) -> DecsyncFile {
        DecsyncFile::new(NativeFile::root(Arc::clone(fs) as Arc<dyn FileSystem>))
    }

    fn engine(fs: &Arc<InMemoryFs>, app_id: &str) -> V2Engine {
        let local = subdir(fs).child("local").child(app_id);
        V2Engine::new(&subdir(fs), local, app_id)
    }

    fn segs(path: &[&str]) -> Vec<String> {
        path.iter().map(|s| (*s).to_owned()).collect()
    }

    fn entry(path: &[&str], datetime: &str, value: &str) -> EntryWithPath {
        EntryWithPath::new(
            &segs(path),
            Entry::with_datetime(datetime, json!("key"), json!(value)),
        )
    }

    fn collect(
        into: &mut Vec<(Vec<String>, Vec<Entry>)>,
    ) -> impl FnMut(&[String], &[Entry]) -> bool + '_ {
        |path, entries| {
            into.push((path.to_vec(), entries.to_vec()));
            true
        }
    }

    #[test]
    fn test_bucket_function() {
        assert_eq!("info", bucket(&segs(&["info"])));
        assert_eq!("70", bucket(&segs(&["p"])));
        // Nested paths hash every segment; ["info", "x"] is not reserved.
        assert_ne!("info", bucket(&segs(&["info", "x"])));
        assert_eq!(bucket(&segs(&["a", "b"])), bucket(&segs(&["a", "b"])));
    }

    #[test]
    fn test_set_entries_writes_bucket_and_sequences() {
        let fs = Arc::new(InMemoryFs::new());
        let engine = engine(&fs, "app");
        engine
            .set_entries(vec![entry(&["p"], "2020-01-01T00:00:00", "v")])
            .unwrap();

        let bucket_file = subdir(&fs).child("v2").child("app").child("70");
        assert_eq!(
            vec![r#"[["p"],"2020-01-01T00:00:00","key","v"]"#.to_owned()],
            bucket_file.read_lines(0).unwrap()
        );
        assert_eq!(
            Some(r#"{"70":1}"#.to_owned()),
            subdir(&fs)
                .child("v2")
                .child("app")
                .child("sequences")
                .read_text()
                .unwrap()
        );
    }

    #[test]
    fn test_set_same_value_is_idempotent() {
        let fs = Arc::new(InMemoryFs::new());
        let engine = engine(&fs, "app");
        engine
            .set_entries(vec![entry(&["p"], "2020-01-01T00:00:00", "v")])
            .unwrap();
        engine
            .set_entries(vec![entry(&["p"], "2020-01-02T00:00:00", "v")])
            .unwrap();

        let bucket_file = subdir(&fs).child("v2").child("app").child("70");
        assert_eq!(1, bucket_file.read_lines(0).unwrap().len());
        assert_eq!(
            Some(r#"{"70":1}"#.to_owned()),
            subdir(&fs)
                .child("v2")
                .child("app")
                .child("sequences")
                .read_text()
                .unwrap()
        );
    }

    #[test]
    fn test_newer_value_replaces_bucket_row() {
        let fs = Arc::new(InMemoryFs::new());
        let engine = engine(&fs, "app");
        engine
            .set_entries(vec![entry(&["p"], "2020-01-01T00:00:00", "old")])
            .unwrap();
        engine
            .set_entries(vec![entry(&["p"], "2020-01-02T00:00:00", "new")])
            .unwrap();

        let bucket_file = subdir(&fs).child("v2").child("app").child("70");
        assert_eq!(
            vec![r#"[["p"],"2020-01-02T00:00:00","key","new"]"#.to_owned()],
            bucket_file.read_lines(0).unwrap()
        );
    }

    #[test]
    fn test_execute_applies_changed_buckets_once() {
        let fs = Arc::new(InMemoryFs::new());
        let writer = engine(&fs, "writer");
        let reader = engine(&fs, "reader");
        writer
            .set_entries(vec![entry(&["p"], "2020-01-01T00:00:00", "v")])
            .unwrap();

        let mut seen = vec![];
        reader.execute_all_new_entries(&mut collect(&mut seen));
        assert_eq!(
            vec![(
                segs(&["p"]),
                vec![Entry::with_datetime("2020-01-01T00:00:00", json!("key"), json!("v"))]
            )],
            seen
        );

        let mut again = vec![];
        reader.execute_all_new_entries(&mut collect(&mut again));
        assert!(again.is_empty());

        // The unchanged bucket is not even opened on the second pass.
        assert_eq!(1, fs.read_count(&["v2", "writer", "70"]));
    }

    #[test]
    fn test_failed_delivery_is_retried() {
        let fs = Arc::new(InMemoryFs::new());
        let writer = engine(&fs, "writer");
        let reader = engine(&fs, "reader");
        writer
            .set_entries(vec![entry(&["p"], "2020-01-01T00:00:00", "v")])
            .unwrap();

        reader.execute_all_new_entries(&mut |_, _| false);
        let mut seen = vec![];
        reader.execute_all_new_entries(&mut collect(&mut seen));
        // The merge already happened on the failed pass; the retried bucket
        // delivers nothing new but the record catches up.
        reader.execute_all_new_entries(&mut collect(&mut seen));
        let mut final_state = vec![];
        reader.execute_stored_entries_for_path_exact(
            &segs(&["p"]),
            None,
            &mut collect(&mut final_state),
        );
        assert_eq!(1, final_state.len());
    }

    #[test]
    fn test_stored_replay_exact_and_prefix() {
        let fs = Arc::new(InMemoryFs::new());
        let engine = engine(&fs, "app");
        engine
            .set_entries(vec![
                entry(&["dir", "a"], "2020-01-01T00:00:00", "1"),
                entry(&["dir", "b"], "2020-01-01T00:00:01", "2"),
                entry(&["other"], "2020-01-01T00:00:02", "3"),
            ])
            .unwrap();

        let mut exact = vec![];
        engine.execute_stored_entries_for_path_exact(
            &segs(&["dir", "a"]),
            None,
            &mut collect(&mut exact),
        );
        assert_eq!(1, exact.len());
        assert_eq!(segs(&["dir", "a"]), exact[0].0);

        let mut prefixed = vec![];
        engine.execute_stored_entries_for_path_prefix(
            &segs(&["dir"]),
            None,
            &mut collect(&mut prefixed),
        );
        assert_eq!(2, prefixed.len());
    }

    #[test]
    fn test_latest_app_id_prefers_max_datetime() {
        let fs = Arc::new(InMemoryFs::new());
        let first = engine(&fs, "first");
        let second = engine(&fs, "second");
        first
            .set_entries(vec![entry(&["p"], "2020-01-01T00:00:00", "a")])
            .unwrap();
        second
            .set_entries(vec![entry(&["q"], "2020-01-02T00:00:00", "b")])
            .unwrap();
        assert_eq!("second", first.latest_app_id());
        assert_eq!("second", second.latest_app_id());
    }

    #[test]
    fn test_corrupt_sequences_treated_as_empty() {
        let fs = Arc::new(InMemoryFs::new());
        let writer = engine(&fs, "writer");
        let reader = engine(&fs, "reader");
        writer
            .set_entries(vec![entry(&["p"], "2020-01-01T00:00:00", "v")])
            .unwrap();
        subdir(&fs)
            .child("local")
            .child("reader")
            .child("sequences")
            .write_text("garbage")
            .unwrap();

        let mut seen = vec![];
        reader.execute_all_new_entries(&mut collect(&mut seen));
        assert_eq!(1, seen.len());
    }
}
