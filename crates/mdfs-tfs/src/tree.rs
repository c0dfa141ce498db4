//! In-memory directory tree.
//!
//! The tree is strictly tree-shaped: no parent pointers, parents are derived
//! by re-traversing the path prefix. Child lookup is a hash-map probe per
//! path segment.

use mdfs_stream::TrackBuffer;
use mdfs_types::TrackId;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// A node in the overlay tree: a file bound to a hidden disc track, or a
/// directory of named children.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum FsNode {
    File(FsFile),
    Directory(FsDirectory),
}

/// An overlay file.
///
/// `byte_length` is the persisted logical size; the backing track payload is
/// padded beyond it. `buffer` is runtime-only streaming state and takes no
/// part in encoding or equality.
#[derive(Debug, Clone, Serialize)]
pub struct FsFile {
    pub id: TrackId,
    pub name: String,
    pub byte_length: u32,
    /// True for the synthesized audio entries, false for TFS-hidden files.
    #[serde(skip)]
    pub audio: bool,
    #[serde(skip)]
    pub buffer: Option<Arc<TrackBuffer>>,
}

impl FsFile {
    #[must_use]
    pub fn new(id: TrackId, name: impl Into<String>, byte_length: u32) -> Self {
        Self {
            id,
            name: name.into(),
            byte_length,
            audio: false,
            buffer: None,
        }
    }
}

impl PartialEq for FsFile {
    fn eq(&self, other: &Self) -> bool {
        // Structural identity only: the streaming buffer is runtime state.
        self.id == other.id
            && self.name == other.name
            && self.byte_length == other.byte_length
            && self.audio == other.audio
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct FsDirectory {
    pub name: String,
    pub children: HashMap<String, FsNode>,
}

impl FsNode {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::File(file) => &file.name,
            Self::Directory(dir) => &dir.name,
        }
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        matches!(self, Self::Directory(_))
    }

    #[must_use]
    pub fn as_file(&self) -> Option<&FsFile> {
        match self {
            Self::File(file) => Some(file),
            Self::Directory(_) => None,
        }
    }

    #[must_use]
    pub fn as_directory(&self) -> Option<&FsDirectory> {
        match self {
            Self::Directory(dir) => Some(dir),
            Self::File(_) => None,
        }
    }
}

/// Split a path on `/`, ignoring empty fragments.
#[must_use]
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|segment| !segment.is_empty()).collect()
}

impl FsDirectory {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: HashMap::new(),
        }
    }

    /// Insert `node` under its own name, replacing any previous child.
    pub fn add(&mut self, node: FsNode) {
        self.children.insert(node.name().to_owned(), node);
    }

    #[must_use]
    pub fn get_child(&self, name: &str) -> Option<&FsNode> {
        self.children.get(name)
    }

    pub fn get_child_mut(&mut self, name: &str) -> Option<&mut FsNode> {
        self.children.get_mut(name)
    }

    pub fn remove_child(&mut self, name: &str) -> Option<FsNode> {
        self.children.remove(name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Track ids of every file in this subtree.
    #[must_use]
    pub fn file_ids(&self) -> Vec<TrackId> {
        let mut ids = Vec::new();
        self.collect_file_ids(&mut ids);
        ids
    }

    fn collect_file_ids(&self, ids: &mut Vec<TrackId>) {
        for child in self.children.values() {
            match child {
                FsNode::File(file) => ids.push(file.id),
                FsNode::Directory(dir) => dir.collect_file_ids(ids),
            }
        }
    }

    /// Resolve `segments` from this directory.
    ///
    /// Traversal stops at the first File encountered (returning it), or
    /// returns the directory at the final segment. A missing intermediate
    /// child resolves to `None`.
    #[must_use]
    pub fn traverse<'a>(&'a self, segments: &[&str]) -> Option<NodeRef<'a>> {
        let mut dir = self;
        for (depth, segment) in segments.iter().enumerate() {
            match dir.get_child(segment)? {
                FsNode::File(file) => return Some(NodeRef::File(file)),
                FsNode::Directory(child) => {
                    if depth + 1 == segments.len() {
                        return Some(NodeRef::Directory(child));
                    }
                    dir = child;
                }
            }
        }
        Some(NodeRef::Directory(dir))
    }

    /// Mutable variant of [`traverse`](Self::traverse).
    pub fn traverse_mut<'a>(&'a mut self, segments: &[&str]) -> Option<NodeRefMut<'a>> {
        let mut dir = self;
        for (depth, segment) in segments.iter().enumerate() {
            match dir.get_child_mut(segment)? {
                FsNode::File(file) => return Some(NodeRefMut::File(file)),
                FsNode::Directory(child) => {
                    if depth + 1 == segments.len() {
                        return Some(NodeRefMut::Directory(child));
                    }
                    dir = child;
                }
            }
        }
        Some(NodeRefMut::Directory(dir))
    }
}

/// Borrowed traversal result.
#[derive(Debug, Clone, Copy)]
pub enum NodeRef<'a> {
    File(&'a FsFile),
    Directory(&'a FsDirectory),
}

#[derive(Debug)]
pub enum NodeRefMut<'a> {
    File(&'a mut FsFile),
    Directory(&'a mut FsDirectory),
}
