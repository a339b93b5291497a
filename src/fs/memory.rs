/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! In-memory adapter. Directories are implicit: a path is a directory when
//! some file lives below it. Reads are counted per path so tests can assert
//! that the sequence-skip optimization really avoids opening files.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::Mutex;

use super::{FileNode, FileSystem};

#[derive(Default)]
pub struct InMemoryFs {
    files: Mutex<BTreeMap<Vec<String>, Vec<u8>>>,
    reads: Mutex<BTreeMap<Vec<String>, u64>>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        InMemoryFs::default()
    }

    /// Number of `read` calls observed for the exact path.
    pub fn read_count(&self, path: &[&str]) -> u64 {
        let path: Vec<String> = path.iter().map(|s| (*s).to_owned()).collect();
        *self.reads.lock().unwrap().get(&path).unwrap_or(&0)
    }

    /// Every stored path with its byte length, for layout assertions.
    pub fn paths(&self) -> Vec<(Vec<String>, usize)> {
        self.files
            .lock()
            .unwrap()
            .iter()
            .map(|(path, bytes)| (path.clone(), bytes.len()))
            .collect()
    }
}

impl FileSystem for InMemoryFs {
    fn node(&self, path: &[String]) -> FileNode {
        let files = self.files.lock().unwrap();
        if let Some(bytes) = files.get(path) {
            return FileNode::File {
                length: bytes.len() as u64,
            };
        }
        let is_dir = files
            .keys()
            .any(|key| key.len() > path.len() && key.starts_with(path));
        if is_dir {
            FileNode::Directory
        } else {
            FileNode::Absent
        }
    }

    fn read(&self, path: &[String], offset: u64) -> io::Result<Vec<u8>> {
        *self.reads.lock().unwrap().entry(path.to_vec()).or_insert(0) += 1;
        let files = self.files.lock().unwrap();
        let bytes = files.get(path).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("'{}'", path.join("/")))
        })?;
        Ok(bytes.get(offset as usize..).unwrap_or(&[]).to_vec())
    }

    fn write(&self, path: &[String], bytes: &[u8], append: bool) -> io::Result<()> {
        let mut files = self.files.lock().unwrap();
        if append {
            files
                .entry(path.to_vec())
                .or_default()
                .extend_from_slice(bytes);
        } else {
            files.insert(path.to_vec(), bytes.to_vec());
        }
        Ok(())
    }

    fn delete(&self, path: &[String]) -> io::Result<()> {
        self.files.lock().unwrap().remove(path);
        Ok(())
    }

    fn children(&self, path: &[String]) -> io::Result<Vec<String>> {
        let files = self.files.lock().unwrap();
        let names: BTreeSet<String> = files
            .keys()
            .filter(|key| key.len() > path.len() && key.starts_with(path))
            .map(|key| key[path.len()].clone())
            .collect();
        Ok(names.into_iter().collect())
    }
}
