/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! `std::fs` adapter rooted at a directory.

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::warn;

use super::{FileNode, FileSystem};

pub struct PosixFs {
    root: PathBuf,
}

impl PosixFs {
    pub fn new(root: &Path) -> Self {
        PosixFs {
            root: root.to_path_buf(),
        }
    }

    fn resolve(&self, path: &[String]) -> PathBuf {
        let mut result = self.root.clone();
        for segment in path {
            result.push(segment);
        }
        result
    }
}

impl FileSystem for PosixFs {
    fn node(&self, path: &[String]) -> FileNode {
        match fs::symlink_metadata(self.resolve(path)) {
            Ok(meta) if meta.is_dir() => FileNode::Directory,
            Ok(meta) => FileNode::File { length: meta.len() },
            Err(err) if err.kind() == io::ErrorKind::NotFound => FileNode::Absent,
            Err(err) => {
                warn!("failed to stat '{}': {}", path.join("/"), err);
                FileNode::Absent
            }
        }
    }

    fn read(&self, path: &[String], offset: u64) -> io::Result<Vec<u8>> {
        let mut file = fs::File::open(self.resolve(path))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    fn write(&self, path: &[String], bytes: &[u8], append: bool) -> io::Result<()> {
        let resolved = self.resolve(path);
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(append)
            .write(true)
            .truncate(!append)
            .open(resolved)?;
        file.write_all(bytes)
    }

    fn delete(&self, path: &[String]) -> io::Result<()> {
        let resolved = self.resolve(path);
        match fs::symlink_metadata(&resolved) {
            Ok(meta) if meta.is_dir() => fs::remove_dir(resolved),
            Ok(_) => fs::remove_file(resolved),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn children(&self, path: &[String]) -> io::Result<Vec<String>> {
        let mut names = vec![];
        for entry in fs::read_dir(self.resolve(path))? {
            let entry = entry?;
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                // Peers only ever write names from the encoded alphabet.
                Err(name) => warn!("skipping non-UTF-8 name {:?}", name),
            }
        }
        Ok(names)
    }
}
