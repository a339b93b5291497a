/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The version-1 engine: paths map to directories, every appId owns an
//! append-only log under `new-entries`, the own snapshot lives under
//! `stored-entries`, and byte cursors under `read-bytes` record how far
//! into each peer's log this instance has consumed.

use std::collections::{BTreeSet, HashMap};

use log::warn;
use serde_json::Value;

use crate::entry::{Deliver, Entry, EntryWithPath, StoredEntry};
use crate::error::Result;
use crate::file::{DecsyncFile, SEQUENCE_FILENAME};

const INFO_DIR: &str = "info";
const NEW_ENTRIES_DIR: &str = "new-entries";
const READ_BYTES_DIR: &str = "read-bytes";
const STORED_ENTRIES_DIR: &str = "stored-entries";
const LATEST_STORED_ENTRY_FILENAME: &str = "latest-stored-entry";

/// The three files relevant to one `(path, appId)` pair.
struct EntriesLocation {
    new_entries_file: DecsyncFile,
    stored_entries_file: DecsyncFile,
    read_bytes_file: DecsyncFile,
}

pub(crate) struct V1Engine {
    dir: DecsyncFile,
    own_app_id: String,
}

impl V1Engine {
    pub fn new(dir: DecsyncFile, own_app_id: &str) -> V1Engine {
        V1Engine {
            dir,
            own_app_id: own_app_id.to_owned(),
        }
    }

    fn location(&self, path: &[String], app_id: &str) -> EntriesLocation {
        EntriesLocation {
            new_entries_file: self.dir.child(NEW_ENTRIES_DIR).child(app_id).child_path(path),
            stored_entries_file: self
                .dir
                .child(STORED_ENTRIES_DIR)
                .child(&self.own_app_id)
                .child_path(path),
            read_bytes_file: self
                .dir
                .child(READ_BYTES_DIR)
                .child(&self.own_app_id)
                .child(app_id)
                .child_path(path),
        }
    }

    fn latest_stored_entry_file(&self, app_id: &str) -> DecsyncFile {
        self.dir
            .child(INFO_DIR)
            .child(app_id)
            .child(LATEST_STORED_ENTRY_FILENAME)
    }

    pub fn set_entries(&self, entries: Vec<EntryWithPath>) -> Result<()> {
        let mut groups: HashMap<Vec<String>, Vec<Entry>> = HashMap::new();
        for entry in entries {
            groups.entry(entry.path).or_default().push(entry.entry);
        }
        for (path, entries) in groups {
            self.set_entries_for_path(&path, entries)?;
        }
        Ok(())
    }

    pub fn set_entries_for_path(&self, path: &[String], mut entries: Vec<Entry>) -> Result<()> {
        let location = self.location(path, &self.own_app_id);
        self.update_stored_entries(&location, &mut entries, true)?;
        if entries.is_empty() {
            return Ok(());
        }
        let lines: Vec<String> = entries
            .iter()
            .map(|entry| serde_json::to_string(entry).unwrap())
            .collect();
        location.new_entries_file.write_lines(&lines, true)?;
        self.update_sequences(path)?;
        Ok(())
    }

    /// Applies `entries` against the own snapshot: stale entries are dropped
    /// from the batch, superseded snapshot rows are removed, survivors are
    /// appended and `latest-stored-entry` is advanced.
    fn update_stored_entries(
        &self,
        location: &EntriesLocation,
        entries: &mut Vec<Entry>,
        require_new_value: bool,
    ) -> std::io::Result<()> {
        let file = &location.stored_entries_file;
        let mut stored: HashMap<String, Entry> = HashMap::new();
        for line in file.read_lines(0)? {
            match serde_json::from_str::<Entry>(&line) {
                Ok(entry) => match stored.get(&entry.key_id()) {
                    Some(known) if !entry.supersedes(known, false) => {}
                    _ => {
                        stored.insert(entry.key_id(), entry);
                    }
                },
                Err(err) => warn!("skipping malformed row in '{}': {}", file.display(), err),
            }
        }

        let mut removed = false;
        entries.retain(|entry| match stored.get(&entry.key_id()) {
            None => true,
            Some(known) if entry.supersedes(known, require_new_value) => {
                stored.remove(&entry.key_id());
                removed = true;
                true
            }
            Some(_) => false,
        });
        if entries.is_empty() {
            return Ok(());
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

        self.update_latest_stored_entry(entries)
    }

    fn update_latest_stored_entry(&self, entries: &[Entry]) -> std::io::Result<()> {
        let max = entries.iter().map(|entry| entry.datetime.as_str()).max();
        let file = self.latest_stored_entry_file(&self.own_app_id);
        let current = file.read_text().unwrap_or(None);
        if let Some(max) = max {
            if current.as_deref() < Some(max) {
                file.write_text(max)?;
            }
        }
        Ok(())
    }

    /// Bumps the sequence of every directory on the way to `path` under the
    /// own `new-entries` tree, so peers can skip unchanged subtrees.
    fn update_sequences(&self, path: &[String]) -> std::io::Result<()> {
        let mut dir = self.dir.child(NEW_ENTRIES_DIR).child(&self.own_app_id);
        Self::bump_sequence(&dir)?;
        for name in path.iter().take(path.len().saturating_sub(1)) {
            dir = dir.child(name);
            Self::bump_sequence(&dir)?;
        }
        Ok(())
    }

    fn bump_sequence(dir: &DecsyncFile) -> std::io::Result<()> {
        let file = dir.hidden_child(SEQUENCE_FILENAME);
        let next = file.read_counter() + 1;
        file.write_text(&next.to_string())
    }

    pub fn execute_all_new_entries(&self, deliver: Deliver) {
        let new_entries_dir = self.dir.child(NEW_ENTRIES_DIR);
        new_entries_dir.reset_cache();
        let mut apps: Vec<String> = new_entries_dir
            .decoded_children()
            .into_iter()
            .map(|(name, _)| name)
            .filter(|name| *name != self.own_app_id)
            .collect();
        apps.sort();
        for app_id in apps {
            let app_dir = new_entries_dir.child(&app_id);
            let read_bytes_dir = self
                .dir
                .child(READ_BYTES_DIR)
                .child(&self.own_app_id)
                .child(&app_id);
            app_dir.list_files_recursive_relative(Some(&read_bytes_dir), &|_| true, &mut |path| {
                self.execute_entries_for_path(path, &app_id, &mut *deliver)
            });
        }
    }

    /// Consumes the unread tail of one peer log file. The cursor moves to
    /// the observed size only when the whole batch was applied and
    /// delivered, so a failed pass is retried.
    fn execute_entries_for_path(&self, path: &[String], app_id: &str, deliver: Deliver) -> bool {
        let location = self.location(path, app_id);
        let cursor = location.read_bytes_file.read_counter();
        let size = location.new_entries_file.length();
        if cursor >= size {
            return true;
        }

        let file = &location.new_entries_file;
        let lines = match file.read_lines(cursor) {
            Ok(lines) => lines,
            Err(err) => {
                warn!("failed to read log '{}': {}", file.display(), err);
                return false;
            }
        };
        let mut latest: HashMap<String, Entry> = HashMap::new();
        for line in lines {
            match serde_json::from_str::<Entry>(&line) {
                Ok(entry) => match latest.get(&entry.key_id()) {
                    Some(known) if !entry.supersedes(known, false) => {}
                    _ => {
                        latest.insert(entry.key_id(), entry);
                    }
                },
                Err(err) => warn!("skipping malformed entry in '{}': {}", file.display(), err),
            }
        }
        let mut entries: Vec<Entry> = latest.into_values().collect();
        entries.sort_by(|a, b| (&a.datetime, a.key_id()).cmp(&(&b.datetime, b.key_id())));

        if let Err(err) = self.update_stored_entries(&location, &mut entries, false) {
            warn!("failed to merge entries for '{}': {}", file.display(), err);
            return false;
        }
        let success = entries.is_empty() || deliver(path, &entries);
        if success {
            if let Err(err) = location.read_bytes_file.write_text(&size.to_string()) {
                warn!(
                    "failed to persist cursor '{}': {}",
                    location.read_bytes_file.display(),
                    err
                );
            }
        }
        success
    }

    pub fn execute_stored_entries_for_path_exact(
        &self,
        path: &[String],
        keys: Option<&[Value]>,
        deliver: Deliver,
    ) -> bool {
        let file = self
            .dir
            .child(STORED_ENTRIES_DIR)
            .child(&self.own_app_id)
            .child_path(path);
        self.execute_stored_file(&file, path, keys, deliver)
    }

    pub fn execute_stored_entries_for_path_prefix(
        &self,
        prefix: &[String],
        keys: Option<&[Value]>,
        deliver: Deliver,
    ) -> bool {
        let dir = self
            .dir
            .child(STORED_ENTRIES_DIR)
            .child(&self.own_app_id)
            .child_path(prefix);
        dir.list_files_recursive_relative(None, &|_| true, &mut |relative| {
            let mut path = prefix.to_vec();
            path.extend(relative.iter().cloned());
            self.execute_stored_file(&dir.child_path(relative), &path, keys, &mut *deliver)
        })
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

    fn execute_stored_file(
        &self,
        file: &DecsyncFile,
        path: &[String],
        keys: Option<&[Value]>,
        deliver: Deliver,
    ) -> bool {
        let lines = match file.read_lines(0) {
            Ok(lines) => lines,
            Err(err) => {
                warn!("failed to read snapshot '{}': {}", file.display(), err);
                return false;
            }
        };
        let mut entries = vec![];
        for line in lines {
            match serde_json::from_str::<Entry>(&line) {
                Ok(entry) => {
                    if keys.map_or(true, |keys| keys.contains(&entry.key)) {
                        entries.push(entry);
                    }
                }
                Err(err) => warn!("skipping malformed row in '{}': {}", file.display(), err),
            }
        }
        entries.is_empty() || deliver(path, &entries)
    }

    pub fn latest_app_id(&self) -> String {
        let mut best_app = self.own_app_id.clone();
        let mut best_datetime: Option<String> = None;
        for (app_id, _) in self.dir.child(INFO_DIR).decoded_children() {
            let datetime = self
                .latest_stored_entry_file(&app_id)
                .read_text()
                .unwrap_or(None);
            if datetime > best_datetime
                || (datetime == best_datetime && app_id == self.own_app_id)
            {
                best_datetime = datetime;
                best_app = app_id;
            }
        }
        best_app
    }

    /// Removes every own subtree, used after upgrading to a newer layout.
    pub fn delete_own(&self) -> std::io::Result<()> {
        for name in [INFO_DIR, NEW_ENTRIES_DIR, READ_BYTES_DIR, STORED_ENTRIES_DIR] {
            self.dir.child(name).child(&self.own_app_id).delete()?;
        }
        Ok(())
    }
}

/// Merges the `["info"]` rows of every app's stored snapshot into `info`,
/// newest datetime per key winning.
pub(crate) fn collect_static_info(subdir: &DecsyncFile, info: &mut HashMap<String, Entry>) {
    for (_, app_dir) in subdir.child(STORED_ENTRIES_DIR).decoded_children() {
        let file = app_dir.child(INFO_DIR);
        let lines = match file.read_lines(0) {
            Ok(lines) => lines,
            Err(err) => {
                warn!("failed to read '{}': {}", file.display(), err);
                continue;
            }
        };
        for line in lines {
            match serde_json::from_str::<Entry>(&line) {
                Ok(entry) => match info.get(&entry.key_id()) {
                    Some(known) if !entry.supersedes(known, false) => {}
                    _ => {
                        info.insert(entry.key_id(), entry);
                    }
                },
                Err(err) => warn!("skipping malformed row in '{}': {}", file.display(), err),
            }
        }
    }
}

/// All appIds visible in the version-1 layout.
pub(crate) fn app_ids(subdir: &DecsyncFile) -> BTreeSet<String> {
    let mut apps = BTreeSet::new();
    for dir in [INFO_DIR, NEW_ENTRIES_DIR, STORED_ENTRIES_DIR] {
        for (name, _) in subdir.child(dir).decoded_children() {
            apps.insert(name);
        }
    }
    apps
}

/// Whether the version-1 layout is present at all (any appId).
pub(crate) fn layout_exists(subdir: &DecsyncFile) -> bool {
    matches!(
        subdir.child(STORED_ENTRIES_DIR).node(),
        crate::fs::FileNode::Directory
    )
}
