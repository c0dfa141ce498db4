//! Disc cache.
//!
//! Holds the overlay tree root, a snapshot of the disc's track listing, the
//! byte sizes presented for audio tracks, the pool of in-progress audio read
//! buffers, and the free-id allocator for new overlay files.

use crate::transfer::TransferCoordinator;
use mdfs_device::toc::{Toc, F_SP_MODE};
use mdfs_device::TrackInfo;
use mdfs_error::Result;
use mdfs_stream::TrackBuffer;
use mdfs_tfs::FsDirectory;
use mdfs_types::{
    TrackId, TrackIndex, LP_HEADER_BYTES, LP_SECTOR_PADDING, SP_HEADER_BYTES, SP_SECTOR_BYTES,
};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

/// Mutable cache contents, guarded by [`Cache`]'s lock.
#[derive(Debug)]
pub struct CacheState {
    pub root: FsDirectory,
    pub tracks: Vec<TrackInfo>,
    /// Byte size presented to userspace for each disc track.
    pub track_sector_lengths: Vec<u64>,
    /// Streaming buffers for in-progress audio reads, keyed by track index.
    pub audio_buffers: HashMap<u16, Arc<TrackBuffer>>,
    /// Smallest unused overlay file id, `None` when the disc is full.
    pub next_file_id: Option<TrackId>,
}

impl CacheState {
    fn empty() -> Self {
        Self {
            root: FsDirectory::new(""),
            tracks: Vec::new(),
            track_sector_lengths: Vec::new(),
            audio_buffers: HashMap::new(),
            next_file_id: Some(TrackId(0)),
        }
    }

    /// Disc index of the track backing overlay file `id`, if it exists.
    #[must_use]
    pub fn resolve_id_to_index(&self, id: TrackId) -> Option<TrackIndex> {
        resolve_hidden(&self.tracks, id)
    }

    /// Claim a fresh file id, skipping ids used by disc tracks and by tree
    /// files not yet flushed.
    pub fn allocate_file_id(&mut self) -> Option<TrackId> {
        let mut used = [false; 256];
        for track in &self.tracks {
            if let Some(id) = track
                .title
                .as_deref()
                .and_then(TrackId::from_hidden_title)
            {
                used[usize::from(id.0)] = true;
            }
        }
        for id in self.root.file_ids() {
            used[usize::from(id.0)] = true;
        }
        let id = (0_u16..256).find(|i| !used[usize::from(*i)]).map(|i| TrackId(i as u8));
        if id.is_none() {
            error!(target: "mdfs::cache", "no free track id, disc is full");
        }
        id
    }

    /// Hidden-file ids present on the disc itself.
    fn disc_next_file_id(&self) -> Option<TrackId> {
        let mut used = [false; 256];
        for track in &self.tracks {
            if let Some(id) = track
                .title
                .as_deref()
                .and_then(TrackId::from_hidden_title)
            {
                used[usize::from(id.0)] = true;
            }
        }
        (0_u16..256).find(|i| !used[usize::from(*i)]).map(|i| TrackId(i as u8))
    }
}

/// Process-wide disc cache; the only owner of the transfer coordinator.
pub struct Cache {
    transfer: Arc<TransferCoordinator>,
    state: Mutex<CacheState>,
}

impl Cache {
    #[must_use]
    pub fn new(transfer: Arc<TransferCoordinator>) -> Self {
        Self {
            transfer,
            state: Mutex::new(CacheState::empty()),
        }
    }

    #[must_use]
    pub fn transfer(&self) -> &Arc<TransferCoordinator> {
        &self.transfer
    }

    /// Lock the cache state. Callers must not block on the device or on a
    /// streaming buffer while holding the guard.
    pub fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock()
    }

    /// Load the overlay root from the disc and take the first snapshot.
    pub fn init(&self) -> Result<()> {
        let root = self.transfer.get_tfs();
        self.state.lock().root = root;
        self.refresh()
    }

    /// Re-read the disc listing and TOC and recompute the derived tables.
    pub fn refresh(&self) -> Result<()> {
        let tracks = self.transfer.list_tracks()?;
        let toc = self.transfer.read_toc()?;

        let lengths = tracks
            .iter()
            .map(|track| presented_length(&toc, track.index))
            .collect();

        let mut state = self.state.lock();
        state.tracks = tracks;
        state.track_sector_lengths = lengths;
        // Track indices shift on erase; in-progress buffers are rebuilt on
        // the next open.
        state.audio_buffers.clear();
        state.next_file_id = state.disc_next_file_id();
        debug!(
            target: "mdfs::cache",
            tracks = state.tracks.len(),
            next_file_id = ?state.next_file_id,
            "cache refreshed"
        );
        Ok(())
    }

    /// Commit the overlay tree, then resync from the device.
    ///
    /// The tree is cloned under the lock and committed outside it, making
    /// the UTOC write the atomicity point: concurrent readers see the old or
    /// the new overlay, never a partial one.
    pub fn flush(&self) -> Result<()> {
        let root = self.state.lock().root.clone();
        self.transfer.write_toc(&root)?;
        self.refresh()
    }

    /// Disc index of the track backing overlay file `id`.
    #[must_use]
    pub fn resolve_id_to_index(&self, id: TrackId) -> Option<TrackIndex> {
        self.state.lock().resolve_id_to_index(id)
    }
}

/// Disc index of the track titled `h_fs_{id:02x}` within a track listing.
#[must_use]
pub fn resolve_hidden(tracks: &[TrackInfo], id: TrackId) -> Option<TrackIndex> {
    let title = id.hidden_title();
    tracks
        .iter()
        .find(|track| track.title.as_deref() == Some(title.as_str()))
        .map(|track| track.index)
}

/// Byte size presented to userspace for one disc track.
fn presented_length(toc: &Toc, index: TrackIndex) -> u64 {
    let sectors = toc.track_sectors(index);
    let is_lp = toc
        .first_fragment_mode(index)
        .map_or(true, |mode| mode & F_SP_MODE == 0);
    let per_sector = SP_SECTOR_BYTES - if is_lp { LP_SECTOR_PADDING } else { 0 };
    let header = if is_lp { LP_HEADER_BYTES } else { SP_HEADER_BYTES };
    sectors * per_sector + header
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdfs_device::sim::SimDevice;
    use mdfs_device::{NetMdDevice, TrackEncoding};
    use mdfs_tfs::{FsFile, FsNode};

    fn cache_with(device: SimDevice) -> Cache {
        let boxed: Box<dyn NetMdDevice> = Box::new(device);
        Cache::new(Arc::new(TransferCoordinator::new(boxed)))
    }

    #[test]
    fn init_on_garbage_sector_adopts_empty_root() {
        let device = SimDevice::new();
        let mut sector = vec![0_u8; mdfs_types::SECTOR_SIZE];
        for (i, byte) in sector.iter_mut().enumerate().skip(mdfs_types::TFS_OFFSET) {
            *byte = (i * 31 + 7) as u8;
        }
        device.seed_utoc_sector(2, sector);

        let cache = cache_with(device);
        cache.init().expect("init");
        let state = cache.lock();
        assert_eq!(state.root.name, "");
        assert!(state.root.is_empty());
        assert_eq!(state.next_file_id, Some(TrackId(0)));
    }

    #[test]
    fn next_file_id_is_smallest_unused() {
        let cache = cache_with(SimDevice::with_tracks(&[
            (Some("h_fs_00"), TrackEncoding::Lp2, 1),
            (Some("music"), TrackEncoding::Sp, 10),
            (Some("h_fs_02"), TrackEncoding::Lp2, 1),
        ]));
        cache.init().expect("init");
        assert_eq!(cache.lock().next_file_id, Some(TrackId(1)));
    }

    #[test]
    fn allocation_skips_unflushed_tree_files() {
        let cache = cache_with(SimDevice::with_tracks(&[(
            Some("h_fs_00"),
            TrackEncoding::Lp2,
            1,
        )]));
        cache.init().expect("init");
        let mut state = cache.lock();
        let first = state.allocate_file_id().expect("id");
        state
            .root
            .add(FsNode::File(FsFile::new(first, "pending.bin", 0)));
        let second = state.allocate_file_id().expect("id");
        assert_eq!(first, TrackId(1));
        assert_eq!(second, TrackId(2));
    }

    #[test]
    fn presented_lengths_follow_the_sector_formula() {
        let cache = cache_with(SimDevice::with_tracks(&[
            (Some("sp track"), TrackEncoding::Sp, 40),
            (Some("lp track"), TrackEncoding::Lp2, 3),
        ]));
        cache.init().expect("init");
        let state = cache.lock();
        assert_eq!(state.track_sector_lengths[0], 40 * 2332 + 2048);
        assert_eq!(state.track_sector_lengths[1], 3 * (2332 - 220) + 48);
    }

    #[test]
    fn resolve_maps_hidden_titles_to_indices() {
        let cache = cache_with(SimDevice::with_tracks(&[
            (Some("music"), TrackEncoding::Sp, 10),
            (Some("h_fs_0a"), TrackEncoding::Lp2, 1),
        ]));
        cache.init().expect("init");
        assert_eq!(
            cache.resolve_id_to_index(TrackId(0x0A)),
            Some(TrackIndex(1))
        );
        assert_eq!(cache.resolve_id_to_index(TrackId(0)), None);
    }

    #[test]
    fn back_to_back_flushes_produce_identical_utoc_bytes() {
        let device = Arc::new(SimDevice::new());
        let cache = Cache::new(Arc::new(TransferCoordinator::new(Box::new(Arc::clone(
            &device,
        )))));
        cache.init().expect("init");
        {
            let mut state = cache.lock();
            let mut sub = FsDirectory::new("dir");
            sub.add(FsNode::File(FsFile::new(TrackId(1), "b.dat", 300)));
            state.root.add(FsNode::Directory(sub));
            state
                .root
                .add(FsNode::File(FsFile::new(TrackId(0), "a.bin", 4)));
        }

        cache.flush().expect("first flush");
        let first: Vec<Vec<u8>> = (0..3).map(|i| device.committed_sector(i)).collect();
        cache.flush().expect("second flush");
        let second: Vec<Vec<u8>> = (0..3).map(|i| device.committed_sector(i)).collect();
        assert_eq!(first, second);
    }
}
