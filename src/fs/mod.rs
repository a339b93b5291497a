/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! File abstraction consumed by the engine.
//!
//! The engine never touches `std::fs` directly; platform adapters implement
//! [`FileSystem`] and the engine addresses nodes through [`NativeFile`],
//! a pure path handle whose current on-disk state is one of the three
//! [`FileNode`] variants.

pub mod memory;
pub mod posix;

use std::io;
use std::sync::Arc;

/// What currently exists at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileNode {
    File { length: u64 },
    Directory,
    Absent,
}

/// Platform adapter over a rooted file tree. Paths are lists of already
/// encoded name segments; the adapter is responsible for materializing
/// parent directories on write.
pub trait FileSystem: Send + Sync {
    fn node(&self, path: &[String]) -> FileNode;
    fn read(&self, path: &[String], offset: u64) -> io::Result<Vec<u8>>;
    fn write(&self, path: &[String], bytes: &[u8], append: bool) -> io::Result<()>;
    fn delete(&self, path: &[String]) -> io::Result<()>;
    fn children(&self, path: &[String]) -> io::Result<Vec<String>>;

    /// Invalidates any cached directory listings. Peers append files through
    /// an external sync tool, so listings taken at call boundaries can be
    /// stale.
    fn reset_cache(&self) {}
}

/// A path within an adapter. Addressing (`child`) performs no I/O; the
/// variant is only resolved when an operation needs it.
#[derive(Clone)]
pub struct NativeFile {
    fs: Arc<dyn FileSystem>,
    path: Vec<String>,
}

impl NativeFile {
    pub fn root(fs: Arc<dyn FileSystem>) -> Self {
        NativeFile { fs, path: vec![] }
    }

    pub fn child(&self, name: &str) -> NativeFile {
        let mut path = self.path.clone();
        path.push(name.to_owned());
        NativeFile {
            fs: Arc::clone(&self.fs),
            path,
        }
    }

    /// Last path segment, empty for the root.
    pub fn name(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or("")
    }

    pub fn node(&self) -> FileNode {
        self.fs.node(&self.path)
    }

    pub fn length(&self) -> u64 {
        match self.node() {
            FileNode::File { length } => length,
            _ => 0,
        }
    }

    /// Reads the file content from `offset`. A directory is an error, an
    /// absent file reads as empty.
    pub fn read(&self, offset: u64) -> io::Result<Vec<u8>> {
        match self.node() {
            FileNode::File { .. } => self.fs.read(&self.path, offset),
            FileNode::Directory => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("'{}' is a directory", self.display()),
            )),
            FileNode::Absent => Ok(vec![]),
        }
    }

    /// Writes `bytes` to the file. Empty content with `append = false`
    /// deletes the file instead: the engine relies on zero-length files
    /// never existing at rest.
    pub fn write(&self, bytes: &[u8], append: bool) -> io::Result<()> {
        if bytes.is_empty() && !append {
            return match self.node() {
                FileNode::Absent => Ok(()),
                _ => self.fs.delete(&self.path),
            };
        }
        if bytes.is_empty() {
            return Ok(());
        }
        self.fs.write(&self.path, bytes, append)
    }

    /// Enumerates child nodes. Files and absent paths have none.
    pub fn children(&self) -> io::Result<Vec<NativeFile>> {
        match self.node() {
            FileNode::Directory => {
                let names = self.fs.children(&self.path)?;
                Ok(names.iter().map(|name| self.child(name)).collect())
            }
            _ => Ok(vec![]),
        }
    }

    /// Post-order recursive delete.
    pub fn delete_recursive(&self) -> io::Result<()> {
        match self.node() {
            FileNode::Absent => Ok(()),
            FileNode::File { .. } => self.fs.delete(&self.path),
            FileNode::Directory => {
                for child in self.children()? {
                    child.delete_recursive()?;
                }
                self.fs.delete(&self.path)
            }
        }
    }

    pub fn reset_cache(&self) {
        self.fs.reset_cache();
    }

    pub fn display(&self) -> String {
        self.path.join("/")
    }
}
