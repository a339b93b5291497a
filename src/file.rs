/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Codec-aware file handle: encoded child names, hidden engine files,
//! line-oriented content and the recursive traversal that drives every
//! scan of the store.

use std::io;

use log::{debug, warn};

use crate::encoding;
use crate::fs::{FileNode, NativeFile};

/// Name of the hidden per-directory counter whose monotonic increase
/// signals "subtree has changed since you last scanned".
pub(crate) const SEQUENCE_FILENAME: &str = "decsync-sequence";

#[derive(Clone)]
pub struct DecsyncFile {
    file: NativeFile,
}

impl DecsyncFile {
    pub fn new(file: NativeFile) -> Self {
        DecsyncFile { file }
    }

    /// Child addressed by a decoded name.
    pub fn child(&self, name: &str) -> DecsyncFile {
        DecsyncFile {
            file: self.file.child(&encoding::encode(name)),
        }
    }

    pub fn child_path(&self, path: &[String]) -> DecsyncFile {
        let mut result = self.clone();
        for name in path {
            result = result.child(name);
        }
        result
    }

    /// Hidden child, used only by engine internals. The codec never produces
    /// a leading dot, so hidden names cannot collide with encoded ones.
    pub fn hidden_child(&self, name: &str) -> DecsyncFile {
        DecsyncFile {
            file: self.file.child(&format!(".{}", encoding::encode(name))),
        }
    }

    pub fn node(&self) -> FileNode {
        self.file.node()
    }

    pub fn length(&self) -> u64 {
        self.file.length()
    }

    pub fn delete(&self) -> io::Result<()> {
        self.file.delete_recursive()
    }

    pub fn reset_cache(&self) {
        self.file.reset_cache()
    }

    pub fn display(&self) -> String {
        self.file.display()
    }

    /// Reads the content from a byte offset and splits it into non-blank
    /// lines.
    pub fn read_lines(&self, offset: u64) -> io::Result<Vec<String>> {
        let bytes = self.file.read(offset)?;
        let text = String::from_utf8(bytes).map_err(|err| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("'{}' is not UTF-8: {}", self.display(), err),
            )
        })?;
        Ok(text
            .split('\n')
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect())
    }

    /// Writes lines joined by `\n` with a trailing newline. Blank lines are
    /// filtered; writing no lines without `append` deletes the file.
    pub fn write_lines(&self, lines: &[String], append: bool) -> io::Result<()> {
        let lines: Vec<&str> = lines
            .iter()
            .map(String::as_str)
            .filter(|line| !line.is_empty())
            .collect();
        if lines.is_empty() {
            return self.file.write(&[], append);
        }
        let mut content = lines.join("\n");
        content.push('\n');
        self.file.write(content.as_bytes(), append)
    }

    /// Single-line content, `None` when the file is absent. More than one
    /// non-blank line is an error.
    pub fn read_text(&self) -> io::Result<Option<String>> {
        let mut lines = self.read_lines(0)?;
        match lines.len() {
            0 => Ok(None),
            1 => Ok(Some(lines.remove(0))),
            n => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("'{}' has {} lines, expected one", self.display(), n),
            )),
        }
    }

    pub fn write_text(&self, text: &str) -> io::Result<()> {
        self.write_lines(&[text.to_owned()], false)
    }

    /// Decimal counter content; absent or unparseable files read as 0.
    pub(crate) fn read_counter(&self) -> u64 {
        match self.read_text() {
            Ok(Some(text)) => text.parse().unwrap_or(0),
            Ok(None) => 0,
            Err(err) => {
                warn!("failed to read counter '{}': {}", self.display(), err);
                0
            }
        }
    }

    /// Non-hidden children with decodable names, decoded.
    pub(crate) fn decoded_children(&self) -> Vec<(String, DecsyncFile)> {
        let children = match self.file.children() {
            Ok(children) => children,
            Err(err) => {
                warn!("failed to list '{}': {}", self.display(), err);
                return vec![];
            }
        };
        let mut result = vec![];
        for child in children {
            let raw = child.name().to_owned();
            if raw.starts_with('.') {
                continue;
            }
            match encoding::decode(&raw) {
                Some(name) => result.push((name, DecsyncFile { file: child })),
                None => warn!("skipping undecodable name '{}'", raw),
            }
        }
        result
    }

    /// Walks the subtree and invokes `action` for every leaf file whose
    /// relative path satisfies `path_pred`. With `read_bytes_src` the walk
    /// skips any directory whose `decsync-sequence` equals the mirrored one
    /// under `read_bytes_src`, and records the observed sequence there after
    /// a fully successful walk. Returns whether every invoked action
    /// succeeded.
    pub fn list_files_recursive_relative(
        &self,
        read_bytes_src: Option<&DecsyncFile>,
        path_pred: &dyn Fn(&[String]) -> bool,
        action: &mut dyn FnMut(&[String]) -> bool,
    ) -> bool {
        self.walk(read_bytes_src, path_pred, action, &mut vec![])
    }

    fn walk(
        &self,
        read_bytes_src: Option<&DecsyncFile>,
        path_pred: &dyn Fn(&[String]) -> bool,
        action: &mut dyn FnMut(&[String]) -> bool,
        prefix: &mut Vec<String>,
    ) -> bool {
        match self.node() {
            FileNode::Absent => true,
            FileNode::File { .. } => {
                if path_pred(prefix) {
                    action(prefix)
                } else {
                    true
                }
            }
            FileNode::Directory => {
                let sequence = match self.hidden_child(SEQUENCE_FILENAME).read_text() {
                    Ok(sequence) => sequence,
                    Err(err) => {
                        warn!("failed to read sequence in '{}': {}", self.display(), err);
                        None
                    }
                };
                if let (Some(src), Some(sequence)) = (read_bytes_src, sequence.as_deref()) {
                    let mirrored = src.hidden_child(SEQUENCE_FILENAME).read_text();
                    if matches!(mirrored, Ok(Some(ref seen)) if seen == sequence) {
                        debug!("skipping unchanged subtree '{}'", self.display());
                        return true;
                    }
                }

                let mut success = true;
                for (name, child) in self.decoded_children() {
                    let src_child = read_bytes_src.map(|src| src.child(&name));
                    prefix.push(name);
                    success &= child.walk(src_child.as_ref(), path_pred, action, prefix);
                    prefix.pop();
                }

                // Record the sequence only after a clean pass, so failed
                // work is retried on the next scan.
                if success {
                    if let (Some(src), Some(sequence)) = (read_bytes_src, sequence) {
                        let mirror = src.hidden_child(SEQUENCE_FILENAME);
                        if let Err(err) = mirror.write_text(&sequence) {
                            warn!("failed to record sequence '{}': {}", mirror.display(), err);
                        }
                    }
                }
                success
            }
        }
    }
}
