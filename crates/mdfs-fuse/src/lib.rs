#![forbid(unsafe_code)]
//! FUSE binding for the mdfs overlay.
//!
//! This crate is a thin translation layer: kernel requests arrive via the
//! `fuser` crate, inode numbers are mapped to overlay paths, and the
//! path-based [`Overlay`] operations do the work. Errors are mapped through
//! `MdfsError::to_errno()`.

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use mdfs_vfs::{Attr, EntryKind, Overlay};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::raw::c_int;
use std::path::Path;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::warn;

/// TTL for cached attributes and entries.
///
/// The overlay mutates underneath the kernel (releases trigger flushes), so
/// the TTL is kept short.
const ATTR_TTL: Duration = Duration::from_secs(1);

const ROOT_INO: u64 = 1;

// ── Error type ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FuseError {
    #[error("invalid mountpoint: {0}")]
    InvalidMountpoint(String),
    #[error("mount I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Inode bookkeeping ───────────────────────────────────────────────────────

/// Bidirectional inode↔path table, grown by `lookup` and pruned on unlink.
#[derive(Debug)]
struct InodeTable {
    by_ino: HashMap<u64, String>,
    by_path: HashMap<String, u64>,
    next: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut table = Self {
            by_ino: HashMap::new(),
            by_path: HashMap::new(),
            next: ROOT_INO + 1,
        };
        table.by_ino.insert(ROOT_INO, "/".to_owned());
        table.by_path.insert("/".to_owned(), ROOT_INO);
        table
    }

    fn path(&self, ino: u64) -> Option<&str> {
        self.by_ino.get(&ino).map(String::as_str)
    }

    fn assign(&mut self, path: &str) -> u64 {
        if let Some(ino) = self.by_path.get(path) {
            return *ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_ino.insert(ino, path.to_owned());
        self.by_path.insert(path.to_owned(), ino);
        ino
    }

    fn forget_path(&mut self, path: &str) {
        if let Some(ino) = self.by_path.remove(path) {
            self.by_ino.remove(&ino);
        }
    }

    /// Re-key every entry under `src` after a rename to `dst`.
    fn rename(&mut self, src: &str, dst: &str) {
        let nested_prefix = format!("{src}/");
        let moved: Vec<String> = self
            .by_path
            .keys()
            .filter(|path| *path == src || path.starts_with(&nested_prefix))
            .cloned()
            .collect();
        for old_path in moved {
            let new_path = format!("{dst}{}", &old_path[src.len()..]);
            if let Some(ino) = self.by_path.remove(&old_path) {
                self.by_ino.insert(ino, new_path.clone());
                self.by_path.insert(new_path, ino);
            }
        }
    }
}

/// Join a parent path and an entry name.
fn join(parent: &str, name: &OsStr) -> String {
    let name = name.to_string_lossy();
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

// ── Mount options ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub allow_other: bool,
    pub auto_unmount: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            allow_other: false,
            auto_unmount: true,
        }
    }
}

// ── FUSE filesystem adapter ─────────────────────────────────────────────────

/// FUSE adapter delegating all operations to an [`Overlay`].
pub struct MdFuse {
    overlay: Overlay,
    inodes: InodeTable,
    mount_time: SystemTime,
}

impl MdFuse {
    #[must_use]
    pub fn new(overlay: Overlay) -> Self {
        Self {
            overlay,
            inodes: InodeTable::new(),
            mount_time: SystemTime::now(),
        }
    }

    fn file_attr(&self, ino: u64, attr: &Attr, req: &Request<'_>) -> FileAttr {
        FileAttr {
            ino,
            size: attr.size,
            blocks: attr.size.div_ceil(512),
            atime: self.mount_time,
            mtime: self.mount_time,
            ctime: self.mount_time,
            crtime: self.mount_time,
            kind: to_fuser_kind(attr.kind),
            perm: attr.perm,
            nlink: attr.nlink,
            uid: req.uid(),
            gid: req.gid(),
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }
}

fn to_fuser_kind(kind: EntryKind) -> FileType {
    match kind {
        EntryKind::File => FileType::RegularFile,
        EntryKind::Directory => FileType::Directory,
    }
}

impl Filesystem for MdFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        Ok(())
    }

    fn destroy(&mut self) {}

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.inodes.path(parent).map(str::to_owned) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = join(&parent_path, name);
        match self.overlay.getattr(&path) {
            Ok(attr) => {
                let ino = self.inodes.assign(&path);
                reply.entry(&ATTR_TTL, &self.file_attr(ino, &attr, req), 0);
            }
            Err(e) => {
                // ENOENT is expected for missing entries, don't warn for it.
                if e.to_errno() != libc::ENOENT {
                    warn!(%path, error = %e, "lookup failed");
                }
                reply.error(e.to_errno());
            }
        }
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.inodes.path(ino).map(str::to_owned) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.overlay.getattr(&path) {
            Ok(attr) => reply.attr(&ATTR_TTL, &self.file_attr(ino, &attr, req)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.inodes.path(ino).map(str::to_owned) else {
            reply.error(libc::ENOENT);
            return;
        };
        if let Some(size) = size {
            if let Err(e) = self.overlay.truncate(&path, size) {
                reply.error(e.to_errno());
                return;
            }
        }
        match self.overlay.getattr(&path) {
            Ok(attr) => reply.attr(&ATTR_TTL, &self.file_attr(ino, &attr, req)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.inodes.path(ino).map(str::to_owned) else {
            reply.error(libc::ENOENT);
            return;
        };
        let entries = match self.overlay.readdir(&path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(%path, error = %e, "readdir failed");
                reply.error(e.to_errno());
                return;
            }
        };

        let mut rows: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_owned()),
            (ino, FileType::Directory, "..".to_owned()),
        ];
        for entry in entries {
            let child_path = join(&path, OsStr::new(&entry.name));
            let child_ino = self.inodes.assign(&child_path);
            rows.push((child_ino, to_fuser_kind(entry.kind), entry.name));
        }

        let start = usize::try_from(offset).unwrap_or(0);
        for (i, (entry_ino, kind, name)) in rows.iter().enumerate().skip(start) {
            let full = reply.add(*entry_ino, (i + 1) as i64, *kind, OsStr::new(name));
            if full {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.inodes.path(ino).map(str::to_owned) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.overlay.open(&path, flags) {
            Ok(fd) => reply.opened(fd, 0),
            Err(e) => {
                warn!(%path, flags, error = %e, "open failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(parent_path) = self.inodes.path(parent).map(str::to_owned) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = join(&parent_path, name);
        let fd = match self.overlay.create(&path) {
            Ok(fd) => fd,
            Err(e) => {
                warn!(%path, error = %e, "create failed");
                reply.error(e.to_errno());
                return;
            }
        };
        match self.overlay.getattr(&path) {
            Ok(attr) => {
                let ino = self.inodes.assign(&path);
                reply.created(&ATTR_TTL, &self.file_attr(ino, &attr, req), 0, fd, 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let byte_offset = u64::try_from(offset).unwrap_or(0);
        match self.overlay.read(fh, byte_offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                warn!(fh, offset, size, error = %e, "read failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let byte_offset = u64::try_from(offset).unwrap_or(0);
        match self.overlay.write(fh, byte_offset, data) {
            Ok(written) => reply.written(written),
            Err(e) => {
                warn!(fh, offset, error = %e, "write failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.overlay.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => {
                warn!(fh, error = %e, "release failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.remove_entry(parent, name, reply);
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        // Directory removal routes through the same overlay operation.
        self.remove_entry(parent, name, reply);
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.inodes.path(parent).map(str::to_owned) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = join(&parent_path, name);
        if let Err(e) = self.overlay.mkdir(&path) {
            warn!(%path, error = %e, "mkdir failed");
            reply.error(e.to_errno());
            return;
        }
        match self.overlay.getattr(&path) {
            Ok(attr) => {
                let ino = self.inodes.assign(&path);
                reply.entry(&ATTR_TTL, &self.file_attr(ino, &attr, req), 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(src_parent), Some(dst_parent)) = (
            self.inodes.path(parent).map(str::to_owned),
            self.inodes.path(newparent).map(str::to_owned),
        ) else {
            reply.error(libc::ENOENT);
            return;
        };
        let src = join(&src_parent, name);
        let dst = join(&dst_parent, newname);
        match self.overlay.rename(&src, &dst) {
            Ok(()) => {
                self.inodes.rename(&src, &dst);
                reply.ok();
            }
            Err(e) => {
                warn!(%src, %dst, error = %e, "rename failed");
                reply.error(e.to_errno());
            }
        }
    }
}

impl MdFuse {
    fn remove_entry(&mut self, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.inodes.path(parent).map(str::to_owned) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = join(&parent_path, name);
        match self.overlay.unlink(&path) {
            Ok(()) => {
                self.inodes.forget_path(&path);
                reply.ok();
            }
            Err(e) => {
                warn!(%path, error = %e, "unlink failed");
                reply.error(e.to_errno());
            }
        }
    }
}

// ── Mount entrypoint ────────────────────────────────────────────────────────

fn build_mount_options(options: &MountOptions) -> Vec<MountOption> {
    let mut opts = vec![
        MountOption::FSName("mdfs".to_owned()),
        MountOption::Subtype("mdfs".to_owned()),
        MountOption::DefaultPermissions,
        MountOption::NoAtime,
    ];

    if options.allow_other {
        opts.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        opts.push(MountOption::AutoUnmount);
    }

    opts
}

/// Mount the overlay at `mountpoint` (blocking until unmounted).
pub fn mount(
    overlay: Overlay,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<(), FuseError> {
    let mountpoint = mountpoint.as_ref();
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    let fuse_opts = build_mount_options(options);
    let fs = MdFuse::new(overlay);
    fuser::mount2(fs, mountpoint, &fuse_opts)?;
    Ok(())
}

/// Mount in the background; unmounts when the session handle is dropped.
pub fn mount_background(
    overlay: Overlay,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<fuser::BackgroundSession, FuseError> {
    let mountpoint = mountpoint.as_ref();
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    let fuse_opts = build_mount_options(options);
    let fs = MdFuse::new(overlay);
    let session = fuser::spawn_mount2(fs, mountpoint, &fuse_opts)?;
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdfs_device::sim::SimDevice;

    fn sim_overlay() -> Overlay {
        Overlay::open_device(Box::new(SimDevice::new())).expect("open device")
    }

    #[test]
    fn inode_table_assigns_stable_numbers() {
        let mut table = InodeTable::new();
        assert_eq!(table.path(ROOT_INO), Some("/"));
        let a = table.assign("/a");
        let b = table.assign("/b");
        assert_ne!(a, b);
        assert_eq!(table.assign("/a"), a);
        assert_eq!(table.path(a), Some("/a"));
    }

    #[test]
    fn inode_table_rename_moves_subtree() {
        let mut table = InodeTable::new();
        let dir = table.assign("/dir");
        let file = table.assign("/dir/file");
        let other = table.assign("/dirty");
        table.rename("/dir", "/new");
        assert_eq!(table.path(dir), Some("/new"));
        assert_eq!(table.path(file), Some("/new/file"));
        assert_eq!(table.path(other), Some("/dirty"));
        assert_eq!(table.assign("/new"), dir);
    }

    #[test]
    fn inode_table_forget_drops_both_directions() {
        let mut table = InodeTable::new();
        let ino = table.assign("/x");
        table.forget_path("/x");
        assert_eq!(table.path(ino), None);
        assert_ne!(table.assign("/x"), ino);
    }

    #[test]
    fn join_handles_the_root() {
        assert_eq!(join("/", OsStr::new("a")), "/a");
        assert_eq!(join("/a", OsStr::new("b")), "/a/b");
    }

    #[test]
    fn entry_kind_conversion() {
        assert_eq!(to_fuser_kind(EntryKind::File), FileType::RegularFile);
        assert_eq!(to_fuser_kind(EntryKind::Directory), FileType::Directory);
    }

    #[test]
    fn mount_rejects_empty_mountpoint() {
        let err = mount(sim_overlay(), "", &MountOptions::default()).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn build_mount_options_respects_flags() {
        let opts = build_mount_options(&MountOptions {
            allow_other: true,
            auto_unmount: false,
        });
        assert!(opts.iter().any(|o| matches!(o, MountOption::AllowOther)));
        assert!(!opts.iter().any(|o| matches!(o, MountOption::AutoUnmount)));
    }
}
