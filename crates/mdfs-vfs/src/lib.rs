#![forbid(unsafe_code)]
//! Host-facing operation set of the overlay.
//!
//! [`Overlay`] translates the host filesystem callbacks (readdir, getattr,
//! open, read, write, release, unlink, mkdir, rename, truncate) into cache
//! and transfer operations. Paths are routed three ways: `/$audio` exposes
//! the disc's ordinary tracks, `/$system` a fixed set of virtual control
//! files, and everything else the overlay tree persisted in the UTOC.
//!
//! Errors are returned as [`MdfsError`]; the host binding maps them with
//! [`MdfsError::to_errno`].

pub mod handle;
pub mod path;
pub mod system;

use crate::handle::{Handle, HandleTable};
use crate::path::{canonical, route, PathTarget, AUDIO_DIR, SYSTEM_DIR};
use mdfs_core::{resolve_hidden, Cache, CacheState, TransferCoordinator};
use mdfs_device::{DownloadConfig, NetMdDevice};
use mdfs_error::{MdfsError, Result};
use mdfs_stream::TrackBuffer;
use mdfs_tfs::tree::{NodeRef, NodeRefMut};
use mdfs_tfs::{codec, FsDirectory, FsFile, FsNode};
use mdfs_types::{TrackId, TrackIndex};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// One row of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// Stat data for one path. `nlink` is always 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr {
    pub kind: EntryKind,
    pub perm: u16,
    pub size: u64,
    pub nlink: u32,
}

impl Attr {
    fn directory() -> Self {
        Self {
            kind: EntryKind::Directory,
            perm: 0o777,
            size: 0,
            nlink: 1,
        }
    }

    fn file(perm: u16, size: u64) -> Self {
        Self {
            kind: EntryKind::File,
            perm,
            size,
            nlink: 1,
        }
    }
}

/// The mounted overlay: cache, coordinator and the open-file table.
pub struct Overlay {
    cache: Arc<Cache>,
    handles: Mutex<HandleTable>,
}

impl Overlay {
    #[must_use]
    pub fn new(cache: Arc<Cache>) -> Self {
        Self {
            cache,
            handles: Mutex::new(HandleTable::new()),
        }
    }

    /// Wire up coordinator and cache over `device` and load the disc.
    pub fn open_device(device: Box<dyn NetMdDevice>) -> Result<Self> {
        let transfer = Arc::new(TransferCoordinator::new(device));
        let cache = Arc::new(Cache::new(transfer));
        cache.init()?;
        Ok(Self::new(cache))
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    // ── Directory listing ───────────────────────────────────────────────

    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        match route(path) {
            PathTarget::Root => {
                let mut entries = vec![
                    DirEntry {
                        name: AUDIO_DIR.to_owned(),
                        kind: EntryKind::Directory,
                    },
                    DirEntry {
                        name: SYSTEM_DIR.to_owned(),
                        kind: EntryKind::Directory,
                    },
                ];
                let state = self.cache.lock();
                entries.extend(state.root.children.values().map(node_entry));
                Ok(entries)
            }
            PathTarget::AudioDir => {
                let state = self.cache.lock();
                Ok(state
                    .tracks
                    .iter()
                    .filter(|track| path::is_audio_track(track))
                    .map(|track| DirEntry {
                        name: path::audio_entry_name(track),
                        kind: EntryKind::File,
                    })
                    .collect())
            }
            PathTarget::SystemDir => Ok(system::SYSTEM_FILES
                .iter()
                .map(|file| DirEntry {
                    name: file.name.to_owned(),
                    kind: EntryKind::File,
                })
                .collect()),
            PathTarget::AudioEntry(_) | PathTarget::SystemEntry(_) => {
                Err(MdfsError::NotDirectory)
            }
            PathTarget::Invalid => Err(MdfsError::NotFound(canonical(path))),
            PathTarget::Overlay(segments) => {
                let state = self.cache.lock();
                match state.root.traverse(&segments) {
                    Some(NodeRef::Directory(dir)) => {
                        Ok(dir.children.values().map(node_entry).collect())
                    }
                    Some(NodeRef::File(_)) => Err(MdfsError::NotDirectory),
                    None => Err(MdfsError::NotFound(canonical(path))),
                }
            }
        }
    }

    // ── Attributes ──────────────────────────────────────────────────────

    pub fn getattr(&self, path: &str) -> Result<Attr> {
        match route(path) {
            PathTarget::Root | PathTarget::AudioDir | PathTarget::SystemDir => {
                Ok(Attr::directory())
            }
            PathTarget::Invalid => Err(MdfsError::NotFound(canonical(path))),
            PathTarget::AudioEntry(name) => {
                let state = self.cache.lock();
                let index =
                    resolve_audio(&state, name).ok_or_else(|| MdfsError::NotFound(canonical(path)))?;
                let size = state
                    .track_sector_lengths
                    .get(index.as_usize())
                    .copied()
                    .unwrap_or(0);
                Ok(Attr::file(0o555, size))
            }
            PathTarget::SystemEntry(name) => {
                let file =
                    system::lookup(name).ok_or_else(|| MdfsError::NotFound(canonical(path)))?;
                let size = if file.readable {
                    self.render_system(file.name)?.len() as u64
                } else {
                    0
                };
                Ok(Attr::file(system::perm(file), size))
            }
            PathTarget::Overlay(segments) => {
                let state = self.cache.lock();
                match state.root.traverse(&segments) {
                    Some(NodeRef::File(file)) => {
                        Ok(Attr::file(0o777, u64::from(file.byte_length)))
                    }
                    Some(NodeRef::Directory(_)) => Ok(Attr::directory()),
                    None => Err(MdfsError::NotFound(canonical(path))),
                }
            }
        }
    }

    // ── Open / create ───────────────────────────────────────────────────

    /// Open `path`. Only `O_RDONLY` and `O_WRONLY` are supported; anything
    /// else is rejected outright.
    pub fn open(&self, path: &str, flags: i32) -> Result<u64> {
        let access = flags & 0b11;
        if access != libc::O_RDONLY && access != libc::O_WRONLY {
            return Err(MdfsError::AccessDenied);
        }
        let write = access == libc::O_WRONLY;

        match route(path) {
            PathTarget::Root | PathTarget::AudioDir | PathTarget::SystemDir => {
                Err(MdfsError::PermissionDenied)
            }
            PathTarget::Invalid => Err(MdfsError::NotFound(canonical(path))),
            PathTarget::AudioEntry(name) => {
                if write {
                    return Err(MdfsError::PermissionDenied);
                }
                let (index, buffer) = {
                    let mut state = self.cache.lock();
                    let index = resolve_audio(&state, name)
                        .ok_or_else(|| MdfsError::NotFound(canonical(path)))?;
                    let buffer = Arc::clone(
                        state
                            .audio_buffers
                            .entry(index.0)
                            .or_insert_with(|| Arc::new(TrackBuffer::new())),
                    );
                    (index, buffer)
                };
                Ok(self.handles.lock().allocate(Handle::AudioRead {
                    path: canonical(path),
                    index,
                    buffer,
                }))
            }
            PathTarget::SystemEntry(name) => {
                let file =
                    system::lookup(name).ok_or_else(|| MdfsError::NotFound(canonical(path)))?;
                if write {
                    if !file.writable {
                        return Err(MdfsError::PermissionDenied);
                    }
                    Ok(self.handles.lock().allocate(Handle::SystemWrite {
                        path: canonical(path),
                        name: file.name.to_owned(),
                        accum: Vec::new(),
                    }))
                } else {
                    if !file.readable {
                        return Err(MdfsError::PermissionDenied);
                    }
                    // Captured before the slot exists, so a `handles` read
                    // does not list its own fd.
                    let payload = self.render_system(file.name)?;
                    Ok(self.handles.lock().allocate(Handle::SystemRead {
                        path: canonical(path),
                        payload,
                    }))
                }
            }
            PathTarget::Overlay(segments) => {
                if write {
                    self.open_overlay_write(&segments, path)
                } else {
                    self.open_overlay_read(&segments, path)
                }
            }
        }
    }

    /// Create a fresh overlay file and return a write handle.
    pub fn create(&self, path: &str) -> Result<u64> {
        match route(path) {
            PathTarget::Overlay(segments) => self.open_overlay_write(&segments, path),
            _ => Err(MdfsError::PermissionDenied),
        }
    }

    fn open_overlay_read(&self, segments: &[&str], raw: &str) -> Result<u64> {
        let handle = {
            let mut state = self.cache.lock();
            match state.root.traverse_mut(segments) {
                None => return Err(MdfsError::NotFound(canonical(raw))),
                Some(NodeRefMut::Directory(_)) => return Err(MdfsError::PermissionDenied),
                Some(NodeRefMut::File(file)) => {
                    let buffer = match &file.buffer {
                        Some(buffer) => Arc::clone(buffer),
                        None => {
                            let buffer = Arc::new(TrackBuffer::new());
                            file.buffer = Some(Arc::clone(&buffer));
                            buffer
                        }
                    };
                    Handle::TfsRead {
                        path: canonical(raw),
                        id: file.id,
                        byte_length: file.byte_length,
                        buffer,
                    }
                }
            }
        };
        Ok(self.handles.lock().allocate(handle))
    }

    /// Create-or-truncate semantics for overlay write handles.
    ///
    /// Shadowing an existing file reuses its track id; the stale backing
    /// track is remembered here and erased at release, inside the same
    /// device-lock acquisition as the replacement upload.
    fn open_overlay_write(&self, segments: &[&str], raw: &str) -> Result<u64> {
        let Some((name, parents)) = segments.split_last() else {
            return Err(MdfsError::PermissionDenied);
        };

        let buffer = Arc::new(TrackBuffer::for_writing());
        let (id, prior_index) = {
            let mut guard = self.cache.lock();
            let state = &mut *guard;

            let target = match state.root.traverse(parents) {
                None => return Err(MdfsError::NotFound(canonical(raw))),
                Some(NodeRef::File(_)) => return Err(MdfsError::NotDirectory),
                Some(NodeRef::Directory(dir)) => match dir.get_child(name) {
                    Some(FsNode::Directory(_)) => return Err(MdfsError::PermissionDenied),
                    Some(FsNode::File(file)) => {
                        let prior = if file.byte_length > 0 {
                            resolve_hidden(&state.tracks, file.id)
                        } else {
                            None
                        };
                        Some((file.id, prior))
                    }
                    None => None,
                },
            };

            let (id, prior_index) = match target {
                Some(existing) => existing,
                None => (
                    state.allocate_file_id().ok_or(MdfsError::NoSpace)?,
                    None,
                ),
            };

            let Some(NodeRefMut::Directory(parent)) = state.root.traverse_mut(parents) else {
                return Err(MdfsError::PermissionDenied);
            };
            let mut file = FsFile::new(id, *name, 0);
            file.buffer = Some(Arc::clone(&buffer));
            parent.add(FsNode::File(file));
            (id, prior_index)
        };

        debug!(
            target: "mdfs::vfs",
            path = %canonical(raw),
            id = %id,
            ?prior_index,
            "overlay file opened for writing"
        );
        Ok(self.handles.lock().allocate(Handle::TfsWrite {
            path: canonical(raw),
            id,
            prior_index,
            buffer,
        }))
    }

    // ── Read / write / release ──────────────────────────────────────────

    pub fn read(&self, fd: u64, offset: u64, length: u32) -> Result<Vec<u8>> {
        enum Plan {
            Tfs {
                buffer: Arc<TrackBuffer>,
                id: TrackId,
                limit: u64,
            },
            Audio {
                buffer: Arc<TrackBuffer>,
                index: TrackIndex,
            },
        }

        let plan = {
            let handles = self.handles.lock();
            match handles.get(fd) {
                None => return Err(MdfsError::AccessDenied),
                Some(Handle::SystemRead { payload, .. }) => {
                    return Ok(slice_payload(payload, offset, length));
                }
                Some(Handle::TfsRead {
                    buffer,
                    id,
                    byte_length,
                    ..
                }) => Plan::Tfs {
                    buffer: Arc::clone(buffer),
                    id: *id,
                    limit: u64::from(*byte_length),
                },
                Some(Handle::AudioRead { buffer, index, .. }) => Plan::Audio {
                    buffer: Arc::clone(buffer),
                    index: *index,
                },
                Some(Handle::TfsWrite { .. } | Handle::SystemWrite { .. }) => {
                    return Err(MdfsError::AccessDenied);
                }
            }
        };

        match plan {
            Plan::Tfs { buffer, id, limit } => {
                if buffer.try_claim_fill() {
                    match self.cache.resolve_id_to_index(id) {
                        Some(index) => self.cache.transfer().start_read_transfer(
                            index,
                            DownloadConfig::hidden(),
                            Arc::clone(&buffer),
                        ),
                        // No backing track: the file has no payload yet.
                        None => buffer.mark_complete(),
                    }
                }
                let end = offset.saturating_add(u64::from(length)).min(limit);
                if end <= offset {
                    return Ok(Vec::new());
                }
                buffer.wait_for(usize::try_from(end).unwrap_or(usize::MAX));
                let start = usize::try_from(offset).unwrap_or(usize::MAX);
                Ok(buffer.read_at(start, (end - offset) as usize))
            }
            Plan::Audio { buffer, index } => {
                if buffer.try_claim_fill() {
                    self.cache.transfer().start_read_transfer(
                        index,
                        DownloadConfig::audio(),
                        Arc::clone(&buffer),
                    );
                }
                let end = offset.saturating_add(u64::from(length));
                buffer.wait_for(usize::try_from(end).unwrap_or(usize::MAX));
                let start = usize::try_from(offset).unwrap_or(usize::MAX);
                Ok(buffer.read_at(start, length as usize))
            }
        }
    }

    pub fn write(&self, fd: u64, offset: u64, data: &[u8]) -> Result<u32> {
        let (buffer, handle_path) = {
            let mut handles = self.handles.lock();
            match handles.get_mut(fd) {
                None => return Err(MdfsError::AccessDenied),
                Some(Handle::SystemWrite { accum, .. }) => {
                    let start = usize::try_from(offset).unwrap_or(usize::MAX);
                    let end = start.saturating_add(data.len());
                    if accum.len() < end {
                        accum.resize(end, 0);
                    }
                    accum[start..end].copy_from_slice(data);
                    return Ok(data.len() as u32);
                }
                Some(Handle::TfsWrite { buffer, path, .. }) => {
                    (Arc::clone(buffer), path.clone())
                }
                Some(_) => return Err(MdfsError::AccessDenied),
            }
        };

        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let new_len = buffer.write_at(start, data);

        // Keep the tree node's logical size live while the handle is open.
        let segments = mdfs_tfs::tree::split_path(&handle_path);
        let mut state = self.cache.lock();
        if let Some(NodeRefMut::File(file)) = state.root.traverse_mut(&segments) {
            file.byte_length = new_len as u32;
        }
        Ok(data.len() as u32)
    }

    /// Invalidate `fd`. Sealing a non-empty write handle uploads the payload
    /// as the backing track and flushes the overlay.
    pub fn release(&self, fd: u64) -> Result<()> {
        let handle = self
            .handles
            .lock()
            .take(fd)
            .ok_or(MdfsError::AccessDenied)?;
        match handle {
            Handle::TfsWrite {
                buffer,
                id,
                prior_index,
                path,
            } => {
                buffer.mark_complete();
                let contents = buffer.snapshot();
                if contents.is_empty() {
                    return Ok(());
                }
                debug!(
                    target: "mdfs::vfs",
                    %path,
                    id = %id,
                    bytes = contents.len(),
                    "sealing overlay file"
                );
                self.cache
                    .transfer()
                    .rewrite_file_track(prior_index, id, &contents)?;
                self.cache.flush()
            }
            Handle::SystemWrite { name, accum, .. } => self.dispatch_system_write(&name, &accum),
            Handle::TfsRead { .. } | Handle::AudioRead { .. } | Handle::SystemRead { .. } => {
                Ok(())
            }
        }
    }

    /// Writes only ever grow the in-memory buffer; truncation is accepted
    /// and ignored.
    pub fn truncate(&self, _path: &str, _size: u64) -> Result<()> {
        Ok(())
    }

    // ── Namespace mutation ──────────────────────────────────────────────

    pub fn unlink(&self, path: &str) -> Result<()> {
        match route(path) {
            PathTarget::Root
            | PathTarget::AudioDir
            | PathTarget::SystemDir
            | PathTarget::SystemEntry(_) => Err(MdfsError::PermissionDenied),
            PathTarget::Invalid => Err(MdfsError::NotFound(canonical(path))),
            PathTarget::AudioEntry(name) => {
                let index = {
                    let state = self.cache.lock();
                    resolve_audio(&state, name)
                        .ok_or_else(|| MdfsError::NotFound(canonical(path)))?
                };
                // The erase updates the TOC on its own; no overlay flush.
                self.cache.transfer().delete_track(index)?;
                self.cache.refresh()
            }
            PathTarget::Overlay(segments) => {
                let Some((name, parents)) = segments.split_last() else {
                    return Err(MdfsError::PermissionDenied);
                };
                let erase_index = {
                    let mut guard = self.cache.lock();
                    let CacheState { root, tracks, .. } = &mut *guard;
                    let parent = match root.traverse_mut(parents) {
                        Some(NodeRefMut::Directory(dir)) => dir,
                        Some(NodeRefMut::File(_)) => return Err(MdfsError::NotDirectory),
                        None => return Err(MdfsError::NotFound(canonical(path))),
                    };
                    match parent.get_child(name) {
                        None => return Err(MdfsError::NotFound(canonical(path))),
                        Some(FsNode::Directory(dir)) if !dir.is_empty() => {
                            return Err(MdfsError::NotEmpty);
                        }
                        Some(_) => {}
                    }
                    match parent.remove_child(name) {
                        Some(FsNode::File(file)) => resolve_hidden(tracks, file.id),
                        _ => None,
                    }
                };
                debug!(target: "mdfs::vfs", path = %canonical(path), ?erase_index, "unlink");
                if let Some(index) = erase_index {
                    self.cache.transfer().delete_track(index)?;
                    self.cache.refresh()?;
                }
                Ok(())
            }
        }
    }

    pub fn mkdir(&self, path: &str) -> Result<()> {
        let PathTarget::Overlay(segments) = route(path) else {
            return Err(MdfsError::PermissionDenied);
        };
        let Some((name, parents)) = segments.split_last() else {
            return Err(MdfsError::PermissionDenied);
        };
        let mut state = self.cache.lock();
        let parent = match state.root.traverse_mut(parents) {
            Some(NodeRefMut::Directory(dir)) => dir,
            // Missing or non-directory parents are both EPERM here.
            _ => return Err(MdfsError::PermissionDenied),
        };
        if parent.get_child(name).is_some() {
            return Err(MdfsError::Exists);
        }
        parent.add(FsNode::Directory(FsDirectory::new(*name)));
        Ok(())
    }

    /// Move `src` to `dst` within the overlay tree. Pure tree surgery: the
    /// device is untouched and the change persists on the next flush.
    pub fn rename(&self, src: &str, dst: &str) -> Result<()> {
        let (PathTarget::Overlay(src_segments), PathTarget::Overlay(dst_segments)) =
            (route(src), route(dst))
        else {
            return Err(MdfsError::PermissionDenied);
        };
        let Some((src_name, src_parents)) = src_segments.split_last() else {
            return Err(MdfsError::PermissionDenied);
        };
        let Some((dst_name, dst_parents)) = dst_segments.split_last() else {
            return Err(MdfsError::PermissionDenied);
        };
        // A directory cannot move into its own subtree.
        if dst_segments.len() > src_segments.len()
            && dst_segments[..src_segments.len()] == src_segments[..]
        {
            return Err(MdfsError::PermissionDenied);
        }

        {
            let mut state = self.cache.lock();

            match state.root.traverse(dst_parents) {
                Some(NodeRef::Directory(dir)) => {
                    if dir.get_child(dst_name).is_some() {
                        return Err(MdfsError::PermissionDenied);
                    }
                }
                _ => return Err(MdfsError::PermissionDenied),
            }

            let node = match state.root.traverse_mut(src_parents) {
                Some(NodeRefMut::Directory(dir)) => dir
                    .remove_child(src_name)
                    .ok_or_else(|| MdfsError::NotFound(canonical(src)))?,
                Some(NodeRefMut::File(_)) => return Err(MdfsError::PermissionDenied),
                None => return Err(MdfsError::NotFound(canonical(src))),
            };

            let node = match node {
                FsNode::File(mut file) => {
                    file.name = (*dst_name).to_owned();
                    FsNode::File(file)
                }
                FsNode::Directory(mut dir) => {
                    dir.name = (*dst_name).to_owned();
                    FsNode::Directory(dir)
                }
            };

            let Some(NodeRefMut::Directory(parent)) = state.root.traverse_mut(dst_parents)
            else {
                return Err(MdfsError::PermissionDenied);
            };
            parent.add(node);
        }

        // Open handles follow the rename so live size updates and the
        // handle dump stay accurate.
        self.handles
            .lock()
            .rewrite_prefix(&canonical(src), &canonical(dst));
        debug!(target: "mdfs::vfs", src = %canonical(src), dst = %canonical(dst), "rename");
        Ok(())
    }

    // ── /$system plumbing ───────────────────────────────────────────────

    fn render_system(&self, name: &str) -> Result<Vec<u8>> {
        match name {
            system::INFO => Ok(system::INFO_TEXT.as_bytes().to_vec()),
            system::HANDLES => Ok(self.handles.lock().dump().into_bytes()),
            system::TFS_BIN => {
                let root = self.cache.lock().root.clone();
                Ok(codec::encode(&root)?)
            }
            _ => Err(MdfsError::PermissionDenied),
        }
    }

    fn dispatch_system_write(&self, name: &str, data: &[u8]) -> Result<()> {
        match name {
            // Replace the in-memory tree; persisted by the next flush.
            system::TFS_BIN => {
                let root = codec::parse(data)?;
                self.cache.lock().root = root;
                Ok(())
            }
            system::FORCE_FLUSH => self.cache.flush(),
            _ => Ok(()),
        }
    }
}

fn node_entry(node: &FsNode) -> DirEntry {
    DirEntry {
        name: node.name().to_owned(),
        kind: if node.is_directory() {
            EntryKind::Directory
        } else {
            EntryKind::File
        },
    }
}

fn resolve_audio(state: &CacheState, name: &str) -> Option<TrackIndex> {
    state
        .tracks
        .iter()
        .filter(|track| path::is_audio_track(track))
        .find(|track| path::audio_entry_name(track) == name)
        .map(|track| track.index)
}

fn slice_payload(payload: &[u8], offset: u64, length: u32) -> Vec<u8> {
    let start = usize::try_from(offset).unwrap_or(usize::MAX);
    if start >= payload.len() {
        return Vec::new();
    }
    let end = start.saturating_add(length as usize).min(payload.len());
    payload[start..end].to_vec()
}
