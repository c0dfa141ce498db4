//! Open-file table.
//!
//! A flat vector with tombstone slots: `None` marks a free slot, allocation
//! reuses the lowest free slot before growing the vector. The table is
//! guarded by one small lock in the adapter; nothing blocks while holding it.

use mdfs_stream::TrackBuffer;
use mdfs_types::{TrackId, TrackIndex};
use std::sync::Arc;

/// One open file.
#[derive(Debug)]
pub enum Handle {
    /// Read handle on an overlay file. Reads clamp at `byte_length`: the
    /// recovered track payload is padded beyond the logical size.
    TfsRead {
        path: String,
        id: TrackId,
        byte_length: u32,
        buffer: Arc<TrackBuffer>,
    },
    /// Write handle on an overlay file. `prior_index` is the backing track
    /// to erase when the handle is released, for files that shadowed an
    /// existing payload.
    TfsWrite {
        path: String,
        id: TrackId,
        prior_index: Option<TrackIndex>,
        buffer: Arc<TrackBuffer>,
    },
    /// Read handle on an audio track.
    AudioRead {
        path: String,
        index: TrackIndex,
        buffer: Arc<TrackBuffer>,
    },
    /// Read handle on a `/$system` file; the payload is captured at open.
    SystemRead { path: String, payload: Vec<u8> },
    /// Write handle on a `/$system` file; the hook runs at release.
    SystemWrite {
        path: String,
        name: String,
        accum: Vec<u8>,
    },
}

impl Handle {
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::TfsRead { path, .. }
            | Self::TfsWrite { path, .. }
            | Self::AudioRead { path, .. }
            | Self::SystemRead { path, .. }
            | Self::SystemWrite { path, .. } => path,
        }
    }

    fn path_mut(&mut self) -> &mut String {
        match self {
            Self::TfsRead { path, .. }
            | Self::TfsWrite { path, .. }
            | Self::AudioRead { path, .. }
            | Self::SystemRead { path, .. }
            | Self::SystemWrite { path, .. } => path,
        }
    }
}

#[derive(Debug, Default)]
pub struct HandleTable {
    slots: Vec<Option<Handle>>,
}

impl HandleTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handle into the lowest free slot.
    pub fn allocate(&mut self, handle: Handle) -> u64 {
        if let Some(slot) = self.slots.iter().position(Option::is_none) {
            self.slots[slot] = Some(handle);
            return slot as u64;
        }
        self.slots.push(Some(handle));
        (self.slots.len() - 1) as u64
    }

    #[must_use]
    pub fn get(&self, fd: u64) -> Option<&Handle> {
        self.slots.get(fd as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, fd: u64) -> Option<&mut Handle> {
        self.slots.get_mut(fd as usize).and_then(Option::as_mut)
    }

    /// Remove and return a handle, leaving a tombstone.
    pub fn take(&mut self, fd: u64) -> Option<Handle> {
        self.slots.get_mut(fd as usize).and_then(Option::take)
    }

    /// `/$system/handles` rendering: one row per slot.
    #[must_use]
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (slot, entry) in self.slots.iter().enumerate() {
            let path = entry.as_ref().map_or("<INVL>", |handle| handle.path());
            out.push_str(&format!("{slot}\t{path}\n"));
        }
        out
    }

    /// Rewrite handle paths after a rename of `src` to `dst`.
    pub fn rewrite_prefix(&mut self, src: &str, dst: &str) {
        for entry in self.slots.iter_mut().flatten() {
            let path = entry.path_mut();
            if path == src {
                *path = dst.to_owned();
            } else if let Some(rest) = path.strip_prefix(src) {
                if rest.starts_with('/') {
                    *path = format!("{dst}{rest}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_handle(path: &str) -> Handle {
        Handle::SystemRead {
            path: path.to_owned(),
            payload: Vec::new(),
        }
    }

    #[test]
    fn allocation_reuses_the_lowest_tombstone() {
        let mut table = HandleTable::new();
        let a = table.allocate(read_handle("/a"));
        let b = table.allocate(read_handle("/b"));
        let c = table.allocate(read_handle("/c"));
        assert_eq!((a, b, c), (0, 1, 2));

        assert!(table.take(b).is_some());
        assert!(table.get(b).is_none());
        let reused = table.allocate(read_handle("/d"));
        assert_eq!(reused, 1);
        let grown = table.allocate(read_handle("/e"));
        assert_eq!(grown, 3);
    }

    #[test]
    fn dump_shows_tombstones() {
        let mut table = HandleTable::new();
        table.allocate(read_handle("/kept"));
        let freed = table.allocate(read_handle("/freed"));
        table.take(freed);
        assert_eq!(table.dump(), "0\t/kept\n1\t<INVL>\n");
    }

    #[test]
    fn rename_rewrites_exact_and_nested_paths() {
        let mut table = HandleTable::new();
        table.allocate(read_handle("/dir/file"));
        table.allocate(read_handle("/dir"));
        table.allocate(read_handle("/dirty"));
        table.rewrite_prefix("/dir", "/renamed");
        assert_eq!(
            table.dump(),
            "0\t/renamed/file\n1\t/renamed\n2\t/dirty\n"
        );
    }
}
