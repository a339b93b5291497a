/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The dispatcher: one instance per application, holding the selected
//! engine, the registered listeners and the local bookkeeping, and running
//! the maintenance and upgrade procedures.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use anyhow::Context;
use chrono::Local;
use log::{error, info, warn};
use serde_json::{json, Value};

use crate::entry::{AppData, Deliver, Entry, EntryWithPath, StoredEntry};
use crate::error::{DecsyncError, Result};
use crate::file::DecsyncFile;
use crate::fs::NativeFile;
use crate::info::{self, LocalInfo, SUPPORTED_VERSION};
use crate::{v1, v2};

const INFO_PATH: &str = "info";

/// Marks whether a listener is invoked for a first-install replay or for a
/// live update carrying the caller's extra data.
pub enum Extra<'a, T> {
    NoExtra,
    WithExtra(&'a T),
}

impl<T> Clone for Extra<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Extra<'_, T> {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum DecsyncVersion {
    V1,
    V2,
}

impl DecsyncVersion {
    fn from_i64(version: i64) -> Result<DecsyncVersion> {
        match version {
            1 => Ok(DecsyncVersion::V1),
            2 => Ok(DecsyncVersion::V2),
            found => Err(DecsyncError::UnsupportedVersion {
                found,
                supported: SUPPORTED_VERSION,
            }),
        }
    }

    fn as_i64(self) -> i64 {
        match self {
            DecsyncVersion::V1 => 1,
            DecsyncVersion::V2 => 2,
        }
    }
}

enum Engine {
    V1(v1::V1Engine),
    V2(v2::V2Engine),
}

impl Engine {
    fn new(
        version: DecsyncVersion,
        subdir: &DecsyncFile,
        local_dir: &DecsyncFile,
        own_app_id: &str,
    ) -> Engine {
        match version {
            DecsyncVersion::V1 => Engine::V1(v1::V1Engine::new(subdir.clone(), own_app_id)),
            DecsyncVersion::V2 => {
                Engine::V2(v2::V2Engine::new(subdir, local_dir.clone(), own_app_id))
            }
        }
    }

    fn set_entries(&self, entries: Vec<EntryWithPath>) -> Result<()> {
        match self {
            Engine::V1(engine) => engine.set_entries(entries),
            Engine::V2(engine) => engine.set_entries(entries),
        }
    }

    fn set_entries_for_path(&self, path: &[String], entries: Vec<Entry>) -> Result<()> {
        match self {
            Engine::V1(engine) => engine.set_entries_for_path(path, entries),
            Engine::V2(engine) => engine.set_entries(
                entries
                    .into_iter()
                    .map(|entry| EntryWithPath::new(path, entry))
                    .collect(),
            ),
        }
    }

    fn execute_all_new_entries(&self, deliver: Deliver) {
        match self {
            Engine::V1(engine) => engine.execute_all_new_entries(deliver),
            Engine::V2(engine) => engine.execute_all_new_entries(deliver),
        }
    }

    fn execute_stored_entries_for_path_exact(
        &self,
        path: &[String],
        keys: Option<&[Value]>,
        deliver: Deliver,
    ) -> bool {
        match self {
            Engine::V1(engine) => engine.execute_stored_entries_for_path_exact(path, keys, deliver),
            Engine::V2(engine) => engine.execute_stored_entries_for_path_exact(path, keys, deliver),
        }
    }

    fn execute_stored_entries_for_path_prefix(
        &self,
        prefix: &[String],
        keys: Option<&[Value]>,
        deliver: Deliver,
    ) -> bool {
        match self {
            Engine::V1(engine) => {
                engine.execute_stored_entries_for_path_prefix(prefix, keys, deliver)
            }
            Engine::V2(engine) => {
                engine.execute_stored_entries_for_path_prefix(prefix, keys, deliver)
            }
        }
    }

    fn execute_stored_entries(&self, stored: &[StoredEntry], deliver: Deliver) -> bool {
        match self {
            Engine::V1(engine) => engine.execute_stored_entries(stored, deliver),
            Engine::V2(engine) => engine.execute_stored_entries(stored, deliver),
        }
    }

    fn latest_app_id(&self) -> String {
        match self {
            Engine::V1(engine) => engine.latest_app_id(),
            Engine::V2(engine) => engine.latest_app_id(),
        }
    }
}

struct Listener<T> {
    subpath: Vec<String>,
    callback: Box<dyn FnMut(&[String], &[Entry], Extra<'_, T>) -> bool>,
}

fn is_maintenance_key(key: &Value) -> bool {
    key.as_str().map_or(false, |key| {
        key.starts_with("last-active-") || key.starts_with("supported-version-")
    })
}

/// Builds the engine-facing delivery callback: filters maintenance keys on
/// the `["info"]` path, routes to the first registered listener whose
/// subpath prefixes the delivered path, and strips that subpath in the
/// version-1 layout.
fn deliver_to_listeners<'a, T>(
    listeners: &'a mut [Listener<T>],
    version: DecsyncVersion,
    extra: Extra<'a, T>,
) -> impl FnMut(&[String], &[Entry]) -> bool + 'a {
    move |path, entries| {
        let filtered: Vec<Entry>;
        let entries = if path.len() == 1 && path[0] == INFO_PATH {
            filtered = entries
                .iter()
                .filter(|entry| !is_maintenance_key(&entry.key))
                .cloned()
                .collect();
            &filtered[..]
        } else {
            entries
        };
        if entries.is_empty() {
            return true;
        }
        match listeners
            .iter_mut()
            .find(|listener| path.starts_with(&listener.subpath))
        {
            None => {
                info!("no listener matches path '{}'", path.join("/"));
                true
            }
            Some(listener) => {
                let delivered: &[String] = match version {
                    DecsyncVersion::V2 => path,
                    DecsyncVersion::V1 => &path[listener.subpath.len()..],
                };
                (listener.callback)(delivered, entries, extra)
            }
        }
    }
}

fn decsync_subdir(
    decsync_dir: &DecsyncFile,
    sync_type: &str,
    collection: Option<&str>,
) -> DecsyncFile {
    let dir = decsync_dir.child(sync_type);
    match collection {
        Some(name) => dir.child(name),
        None => dir,
    }
}

/// A DecSync instance for one application. Calls against one instance must
/// be serialized by the caller; instances with distinct `own_app_id`s are
/// safe to run in parallel over a shared directory.
pub struct Decsync<T> {
    decsync_dir: DecsyncFile,
    local_dir: DecsyncFile,
    subdir: DecsyncFile,
    own_app_id: String,
    version: DecsyncVersion,
    engine: Engine,
    local_info: LocalInfo,
    listeners: Vec<Listener<T>>,
    is_in_init: bool,
}

impl<T> Decsync<T> {
    /// Opens an instance over `decsync_dir` for `own_app_id`, keeping its
    /// private bookkeeping under `local_dir`. The on-disk version is chosen
    /// from the local info if present, otherwise from on-disk evidence, and
    /// persisted locally.
    pub fn new(
        decsync_dir: NativeFile,
        local_dir: NativeFile,
        sync_type: &str,
        collection: Option<&str>,
        own_app_id: &str,
    ) -> Result<Decsync<T>> {
        let decsync_dir = DecsyncFile::new(decsync_dir);
        let local_dir = DecsyncFile::new(local_dir);
        let global_info = info::get_decsync_info(&decsync_dir)?;
        let global_version = DecsyncVersion::from_i64(info::info_version(&global_info)?)?;
        let subdir = decsync_subdir(&decsync_dir, sync_type, collection);

        let mut local_info = LocalInfo::load(&local_dir);
        let version = match local_info.get_i64("version") {
            Some(version) => DecsyncVersion::from_i64(version)?,
            None => {
                let version = if v2::layout_exists(&subdir) {
                    DecsyncVersion::V2
                } else if v1::layout_exists(&subdir) {
                    DecsyncVersion::V1
                } else {
                    global_version
                };
                local_info
                    .put("version", json!(version.as_i64()))
                    .map_err(DecsyncError::from_io)?;
                version
            }
        };
        info!(
            "opening '{}' as '{}' with version {}",
            subdir.display(),
            own_app_id,
            version.as_i64()
        );

        let engine = Engine::new(version, &subdir, &local_dir, own_app_id);
        Ok(Decsync {
            decsync_dir,
            local_dir,
            subdir,
            own_app_id: own_app_id.to_owned(),
            version,
            engine,
            local_info,
            listeners: vec![],
            is_in_init: false,
        })
    }

    /// Registers a single-entry listener for paths under `subpath`. The
    /// first registered listener matching a path receives its entries; in
    /// the version-1 layout the subpath is stripped before delivery, the
    /// version-2 layout delivers paths verbatim.
    pub fn add_listener<F>(&mut self, subpath: &[String], mut on_entry: F)
    where
        F: FnMut(&[String], &Entry, Extra<'_, T>) -> bool + 'static,
    {
        self.add_multi_listener(subpath, move |path, entries, extra| {
            entries.iter().all(|entry| on_entry(path, entry, extra))
        });
    }

    /// Registers a listener receiving whole batches of entries.
    pub fn add_multi_listener<F>(&mut self, subpath: &[String], on_entries: F)
    where
        F: FnMut(&[String], &[Entry], Extra<'_, T>) -> bool + 'static,
    {
        self.listeners.push(Listener {
            subpath: subpath.to_vec(),
            callback: Box::new(on_entries),
        });
    }

    /// Publishes one key/value under a path, stamped with the current time.
    pub fn set_entry(&self, path: &[String], key: Value, value: Value) -> Result<()> {
        self.set_entries_for_path(path, vec![Entry::new(key, value)])
    }

    pub fn set_entries(&self, entries: Vec<EntryWithPath>) -> Result<()> {
        self.engine.set_entries(entries)
    }

    pub fn set_entries_for_path(&self, path: &[String], entries: Vec<Entry>) -> Result<()> {
        self.engine.set_entries_for_path(path, entries)
    }

    /// Consumes every peer's unread updates, delivering them to listeners,
    /// and then runs maintenance (upgrade check, `last-active` heartbeat,
    /// `supported-version` publication) unless disabled.
    pub fn execute_all_new_entries(&mut self, extra: &T, disable_maintenance: bool) {
        self.execute_all_new_entries_internal(Extra::WithExtra(extra), !disable_maintenance)
    }

    fn execute_all_new_entries_internal(&mut self, extra: Extra<'_, T>, maintenance: bool) {
        {
            let mut suppressed = |_: &[String], _: &[Entry]| true;
            let mut live = deliver_to_listeners(&mut self.listeners, self.version, extra);
            let deliver: Deliver = if self.is_in_init {
                &mut suppressed
            } else {
                &mut live
            };
            self.engine.execute_all_new_entries(deliver);
        }
        if maintenance {
            if let Err(err) = self.run_maintenance(extra) {
                error!("maintenance failed: {:?}", err);
            }
        }
    }

    fn run_maintenance(&mut self, extra: Extra<'_, T>) -> anyhow::Result<()> {
        let global_info = info::get_decsync_info(&self.decsync_dir)
            .with_context(|| "failed to re-read .decsync-info")?;
        let global_version = DecsyncVersion::from_i64(info::info_version(&global_info)?)?;
        if global_version > self.version {
            self.upgrade(global_version)
                .with_context(|| "failed to upgrade")?;
            let mut suppressed = |_: &[String], _: &[Entry]| true;
            let mut live = deliver_to_listeners(&mut self.listeners, self.version, extra);
            let deliver: Deliver = if self.is_in_init {
                &mut suppressed
            } else {
                &mut live
            };
            self.engine.execute_all_new_entries(deliver);
        }

        let today = Local::now().format("%Y-%m-%d").to_string();
        let last_active = self.local_info.get_str("last-active").map(str::to_owned);
        if last_active.as_deref().map_or(true, |last| last < today.as_str()) {
            self.local_info
                .put("last-active", json!(today))
                .with_context(|| "failed to update local last-active")?;
            self.set_entry(
                &[INFO_PATH.to_owned()],
                json!(format!("last-active-{}", self.own_app_id)),
                json!(today),
            )?;
        }

        let supported = self.local_info.get_i64("supported-version").unwrap_or(0);
        if supported < SUPPORTED_VERSION {
            self.local_info
                .put("supported-version", json!(SUPPORTED_VERSION))
                .with_context(|| "failed to update local supported-version")?;
            self.set_entry(
                &[INFO_PATH.to_owned()],
                json!(format!("supported-version-{}", self.own_app_id)),
                json!(SUPPORTED_VERSION),
            )?;
        }
        Ok(())
    }

    /// Replays the full own snapshot through a transient collector into the
    /// new engine, then removes the old own subtrees. Cleanup failures are
    /// non-fatal: leftovers only cost disk space.
    fn upgrade(&mut self, new_version: DecsyncVersion) -> anyhow::Result<()> {
        info!(
            "upgrading '{}' from version {} to {}",
            self.subdir.display(),
            self.version.as_i64(),
            new_version.as_i64()
        );
        let mut collected: Vec<EntryWithPath> = vec![];
        {
            let mut collect = |path: &[String], entries: &[Entry]| {
                for entry in entries {
                    collected.push(EntryWithPath::new(path, entry.clone()));
                }
                true
            };
            self.engine
                .execute_stored_entries_for_path_prefix(&[], None, &mut collect);
        }

        let new_engine = Engine::new(new_version, &self.subdir, &self.local_dir, &self.own_app_id);
        new_engine.set_entries(collected)?;

        let old_engine = std::mem::replace(&mut self.engine, new_engine);
        if let Engine::V1(old) = &old_engine {
            if let Err(err) = old.delete_own() {
                warn!("failed to clean up old own data: {}", err);
            }
        }
        self.version = new_version;
        self.local_info
            .put("version", json!(new_version.as_i64()))
            .with_context(|| "failed to persist upgraded version")?;
        Ok(())
    }

    /// Materializes the current state for a fresh install: consumes every
    /// peer's entries with live delivery suppressed, then replays the own
    /// snapshot to listeners with the `NoExtra` marker.
    pub fn init_stored_entries(&mut self) {
        self.is_in_init = true;
        self.execute_all_new_entries_internal(Extra::NoExtra, true);
        {
            let mut deliver =
                deliver_to_listeners(&mut self.listeners, self.version, Extra::NoExtra);
            self.engine
                .execute_stored_entries_for_path_prefix(&[], None, &mut deliver);
        }
        self.is_in_init = false;
    }

    pub fn execute_stored_entry(&mut self, path: &[String], key: Value, extra: &T) {
        self.execute_stored_entries_for_path_exact(path, extra, Some(&[key]));
    }

    pub fn execute_stored_entries(&mut self, stored: &[StoredEntry], extra: &T) {
        let mut deliver =
            deliver_to_listeners(&mut self.listeners, self.version, Extra::WithExtra(extra));
        self.engine.execute_stored_entries(stored, &mut deliver);
    }

    pub fn execute_stored_entries_for_path_exact(
        &mut self,
        path: &[String],
        extra: &T,
        keys: Option<&[Value]>,
    ) {
        let mut deliver =
            deliver_to_listeners(&mut self.listeners, self.version, Extra::WithExtra(extra));
        self.engine
            .execute_stored_entries_for_path_exact(path, keys, &mut deliver);
    }

    pub fn execute_stored_entries_for_path_prefix(
        &mut self,
        prefix: &[String],
        extra: &T,
        keys: Option<&[Value]>,
    ) {
        let mut deliver =
            deliver_to_listeners(&mut self.listeners, self.version, Extra::WithExtra(extra));
        self.engine
            .execute_stored_entries_for_path_prefix(prefix, keys, &mut deliver);
    }

    /// The appId with the most recent stored entry, ties in favour of the
    /// own one. Useful to pick the most up-to-date peer to bootstrap from.
    pub fn latest_app_id(&self) -> String {
        self.engine.latest_app_id()
    }
}

/// Validates the `.decsync-info` of a directory, creating the default one
/// when absent.
pub fn check_decsync_info(decsync_dir: &NativeFile) -> Result<()> {
    let dir = DecsyncFile::new(decsync_dir.clone());
    let global_info = info::get_decsync_info(&dir)?;
    info::info_version(&global_info)?;
    Ok(())
}

/// The merged `["info"]` entries of every app in both layouts, newest
/// datetime per key winning. Keys are returned in their serialized JSON
/// form (`serde_json::Value` is not hashable).
pub fn get_static_info(
    decsync_dir: &NativeFile,
    sync_type: &str,
    collection: Option<&str>,
) -> Result<HashMap<String, Value>> {
    check_decsync_info(decsync_dir)?;
    let dir = DecsyncFile::new(decsync_dir.clone());
    let subdir = decsync_subdir(&dir, sync_type, collection);
    let mut merged: HashMap<String, Entry> = HashMap::new();
    v1::collect_static_info(&subdir, &mut merged);
    v2::collect_static_info(&subdir, &mut merged);
    Ok(merged
        .into_iter()
        .map(|(key, entry)| (key, entry.value))
        .collect())
}

/// The collection names under a sync type, in no particular order.
pub fn list_collections(decsync_dir: &NativeFile, sync_type: &str) -> Vec<String> {
    let dir = DecsyncFile::new(decsync_dir.clone());
    dir.child(sync_type)
        .decoded_children()
        .into_iter()
        .filter(|(_, child)| matches!(child.node(), crate::fs::FileNode::Directory))
        .map(|(name, _)| name)
        .collect()
}

/// The on-disk version plus a summary of every app that ever wrote to the
/// collection, with its last activity day and supported version.
pub fn get_active_apps(
    decsync_dir: &NativeFile,
    sync_type: &str,
    collection: Option<&str>,
) -> Result<(i64, Vec<AppData>)> {
    let dir = DecsyncFile::new(decsync_dir.clone());
    let global_info = info::get_decsync_info(&dir)?;
    let version = info::info_version(&global_info)?;
    let subdir = decsync_subdir(&dir, sync_type, collection);

    let mut merged: HashMap<String, Entry> = HashMap::new();
    v1::collect_static_info(&subdir, &mut merged);
    v2::collect_static_info(&subdir, &mut merged);

    let mut apps = v1::app_ids(&subdir);
    apps.extend(v2::app_ids(&subdir));
    let apps = apps
        .into_iter()
        .map(|app_id| {
            let last_active = merged
                .get(&json!(format!("last-active-{}", app_id)).to_string())
                .and_then(|entry| entry.value.as_str())
                .map(str::to_owned);
            let app_version = merged
                .get(&json!(format!("supported-version-{}", app_id)).to_string())
                .and_then(|entry| entry.value.as_i64())
                .unwrap_or(1);
            AppData {
                app_id,
                last_active,
                version: app_version,
            }
        })
        .collect();
    Ok((version, apps))
}

/// Default DecSync directory from the environment: `DECSYNC_DIR`, then
/// `XDG_DATA_HOME/decsync`, then the home directory's data dir.
pub fn get_default_decsync_dir() -> Option<PathBuf> {
    if let Some(dir) = env::var_os("DECSYNC_DIR") {
        return Some(PathBuf::from(dir));
    }
    if let Some(dir) = env::var_os("XDG_DATA_HOME") {
        return Some(PathBuf::from(dir).join("decsync"));
    }
    if cfg!(windows) {
        env::var_os("USERPROFILE").map(|home| PathBuf::from(home).join("decsync"))
    } else {
        env::var_os("HOME").map(|home| {
            PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("decsync")
        })
    }
}
