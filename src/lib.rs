/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Filesystem-backed, conflict-free synchronization.
//!
//! Cooperating applications share a directory (reconciled out-of-band by a
//! file-sync tool) and use it as a last-writer-wins key-value store
//! organized by hierarchical paths. An instance belongs to one application:
//! it publishes updates through [`Decsync::set_entry`], observes peer
//! updates through listeners driven by [`Decsync::execute_all_new_entries`],
//! and materializes the current state for a fresh install with
//! [`Decsync::init_stored_entries`].
//!
//! The engine consumes an abstract [`fs::FileSystem`] adapter; a `std::fs`
//! implementation and an in-memory one are provided.

pub mod diff;
pub mod encoding;
pub mod entry;
pub mod error;
pub mod file;
pub mod fs;
mod info;
mod instance;
mod v1;
mod v2;

pub use entry::{AppData, Entry, EntryWithPath, StoredEntry};
pub use error::{DecsyncError, Result};
pub use info::SUPPORTED_VERSION;
pub use instance::{
    check_decsync_info, get_active_apps, get_default_decsync_dir, get_static_info,
    list_collections, Decsync, Extra,
};
