//! Serialized device operations.
//!
//! Every public method acquires the coordinator-wide device lock on entry
//! and releases it on exit, failures included; no method is reentrant. A
//! method that needs another device operation calls the driver directly
//! inside its own critical section.

use mdfs_device::toc::{parse_toc, reconstruct_toc, Toc, F_SP_MODE, F_STEREO, F_WRITABLE};
use mdfs_device::{
    ChunkKind, DiscState, DownloadConfig, NetMdDevice, TrackInfo, WireFormat,
};
use mdfs_error::Result;
use mdfs_stream::TrackBuffer;
use mdfs_tfs::{codec, FsDirectory};
use mdfs_types::{
    ParseError, TrackId, TrackIndex, HIDDEN_TITLE_PREFIX, MIN_HIDDEN_TRACK_BYTES, SECTOR_SIZE,
    TFS_OFFSET,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

struct CoordinatorInner {
    device: Box<dyn NetMdDevice>,
    /// Serializes every device-touching operation.
    device_lock: Mutex<()>,
}

/// Wrapper around the device driver that totally orders device operations.
#[derive(Clone)]
pub struct TransferCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl TransferCoordinator {
    #[must_use]
    pub fn new(device: Box<dyn NetMdDevice>) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                device,
                device_lock: Mutex::new(()),
            }),
        }
    }

    pub fn list_tracks(&self) -> Result<Vec<TrackInfo>> {
        let _guard = self.inner.device_lock.lock();
        self.inner.device.list_tracks()
    }

    pub fn disc_state(&self) -> Result<DiscState> {
        let _guard = self.inner.device_lock.lock();
        self.inner.device.disc_state()
    }

    /// Read and parse UTOC sectors 0 and 1.
    pub fn read_toc(&self) -> Result<Toc> {
        let _guard = self.inner.device_lock.lock();
        let sector0 = self.inner.device.read_utoc_sector(0)?;
        let sector1 = self.inner.device.read_utoc_sector(1)?;
        Ok(parse_toc(&sector0, &sector1)?)
    }

    /// Read the overlay record out of UTOC sector 2.
    ///
    /// A disc without the record (or with a damaged one) is treated as
    /// unformatted: the result is an empty root directory named `""`.
    pub fn get_tfs(&self) -> FsDirectory {
        let _guard = self.inner.device_lock.lock();
        let sector = match self.inner.device.read_utoc_sector(2) {
            Ok(sector) => sector,
            Err(error) => {
                warn!(target: "mdfs::transfer", %error, "UTOC sector 2 unreadable");
                return FsDirectory::new("");
            }
        };
        if sector.len() < TFS_OFFSET {
            warn!(target: "mdfs::transfer", len = sector.len(), "UTOC sector 2 truncated");
            return FsDirectory::new("");
        }
        match codec::parse(&sector[TFS_OFFSET..]) {
            Ok(root) => root,
            Err(ParseError::InvalidMagic { .. }) => {
                info!(target: "mdfs::transfer", "disc is unformatted, starting with an empty overlay");
                FsDirectory::new("")
            }
            Err(error) => {
                warn!(target: "mdfs::transfer", %error, "overlay record damaged, ignoring it");
                FsDirectory::new("")
            }
        }
    }

    /// Start the chunked recovery of one track into `buffer`.
    ///
    /// Returns immediately; a worker thread holds the device lock for the
    /// duration of the stream. Header chunks are kept only for audio reads,
    /// audio-data chunks always, anything else is dropped. The buffer is
    /// sealed on completion and on device failure alike, so waiting readers
    /// always drain.
    pub fn start_read_transfer(
        &self,
        index: TrackIndex,
        config: DownloadConfig,
        buffer: Arc<TrackBuffer>,
    ) {
        let inner = Arc::clone(&self.inner);
        thread::spawn(move || {
            let _guard = inner.device_lock.lock();
            debug!(target: "mdfs::transfer", index = index.0, "read transfer started");
            let keep_header = config.include_header;
            let sink_buffer = Arc::clone(&buffer);
            let result = inner.device.download_track(index, &config, &mut |chunk| {
                match chunk.kind {
                    ChunkKind::Header if keep_header => sink_buffer.append(&chunk.data),
                    ChunkKind::AudioData => sink_buffer.append(&chunk.data),
                    _ => {}
                }
                Ok(())
            });
            if let Err(error) = result {
                warn!(
                    target: "mdfs::transfer",
                    index = index.0,
                    %error,
                    "read transfer failed, sealing buffer with partial contents"
                );
            }
            buffer.mark_complete();
        });
    }

    /// Upload `data` as the hidden track backing file `id`.
    ///
    /// The payload is zero-padded to the minimum track size and written in
    /// LP2 wire format.
    pub fn write_file_track(&self, id: TrackId, data: &[u8]) -> Result<()> {
        let _guard = self.inner.device_lock.lock();
        self.upload_locked(id, data)
    }

    /// Replace the backing track of file `id`: erase the prior track (if
    /// any) and upload the new payload under a single lock acquisition, so
    /// no other device operation can land inside the erase→upload window.
    pub fn rewrite_file_track(
        &self,
        prior_index: Option<TrackIndex>,
        id: TrackId,
        data: &[u8],
    ) -> Result<()> {
        let _guard = self.inner.device_lock.lock();
        if let Some(index) = prior_index {
            debug!(target: "mdfs::transfer", index = index.0, id = %id, "erasing prior backing track");
            self.inner.device.erase_track(index)?;
        }
        self.upload_locked(id, data)
    }

    fn upload_locked(&self, id: TrackId, data: &[u8]) -> Result<()> {
        let mut payload = data.to_vec();
        if payload.len() < MIN_HIDDEN_TRACK_BYTES {
            payload.resize(MIN_HIDDEN_TRACK_BYTES, 0);
        }
        let title = id.hidden_title();
        debug!(target: "mdfs::transfer", %title, bytes = payload.len(), "uploading backing track");
        self.inner
            .device
            .upload_track(&title, WireFormat::Lp2, &payload)
    }

    /// Erase the track at `index`. The caller refreshes the cache.
    pub fn delete_track(&self, index: TrackIndex) -> Result<()> {
        let _guard = self.inner.device_lock.lock();
        debug!(target: "mdfs::transfer", index = index.0, "erase track");
        self.inner.device.erase_track(index)
    }

    /// Commit `root` to the disc.
    ///
    /// The overlay record is encoded before anything touches the device: an
    /// oversized tree aborts the whole operation. Then, in one UTOC
    /// read-modify-write cycle: every fragment of every `h_fs_*` track is
    /// stamped SP+stereo and write-protected, sectors 0 and 1 are re-emitted,
    /// sector 2 is rewritten with the record at its fixed offset, and the
    /// UTOC is force-committed. The stamping precedes the record in the same
    /// cycle so a committed TOC never exposes a hidden track as writable.
    pub fn write_toc(&self, root: &FsDirectory) -> Result<()> {
        let record = codec::encode(root)?;

        let _guard = self.inner.device_lock.lock();
        let sector0 = self.inner.device.read_utoc_sector(0)?;
        let sector1 = self.inner.device.read_utoc_sector(1)?;
        let mut toc = parse_toc(&sector0, &sector1)?;

        for i in 0..u16::from(toc.n_tracks) {
            let index = TrackIndex(i);
            let hidden = toc
                .title(index)
                .is_some_and(|title| title.starts_with(HIDDEN_TITLE_PREFIX));
            if hidden {
                toc.stamp_fragment_modes(index, F_SP_MODE | F_STEREO, F_WRITABLE);
            }
        }

        let [sector0, sector1] = reconstruct_toc(&toc);
        self.inner.device.write_utoc_sector(0, &sector0)?;
        self.inner.device.write_utoc_sector(1, &sector1)?;

        let mut sector2 = vec![0_u8; SECTOR_SIZE];
        sector2[TFS_OFFSET..TFS_OFFSET + record.len()].copy_from_slice(&record);
        self.inner.device.write_utoc_sector(2, &sector2)?;

        debug!(target: "mdfs::transfer", record_len = record.len(), "committing UTOC");
        self.inner.device.force_toc_commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdfs_device::sim::SimDevice;
    use mdfs_device::TrackEncoding;
    use mdfs_tfs::{FsFile, FsNode};

    fn coordinator_with(device: SimDevice) -> (TransferCoordinator, Arc<SimDevice>) {
        let device = Arc::new(device);
        let boxed: Box<dyn NetMdDevice> = Box::new(Arc::clone(&device));
        (TransferCoordinator::new(boxed), device)
    }

    #[test]
    fn get_tfs_recovers_empty_root_from_garbage() {
        let (coordinator, device) = coordinator_with(SimDevice::new());
        let mut sector = vec![0_u8; SECTOR_SIZE];
        for (i, byte) in sector.iter_mut().enumerate().skip(TFS_OFFSET) {
            *byte = (i * 7 + 13) as u8;
        }
        device.seed_utoc_sector(2, sector);

        let root = coordinator.get_tfs();
        assert_eq!(root.name, "");
        assert!(root.is_empty());
    }

    #[test]
    fn write_toc_round_trips_the_overlay() {
        let (coordinator, device) = coordinator_with(SimDevice::new());
        let mut root = FsDirectory::new("");
        root.add(FsNode::File(FsFile::new(TrackId(0), "a.bin", 4)));

        coordinator.write_toc(&root).expect("write_toc");
        assert_eq!(device.commit_count(), 1);

        let committed = device.committed_sector(2);
        assert!(committed[..TFS_OFFSET].iter().all(|b| *b == 0));
        let decoded = codec::parse(&committed[TFS_OFFSET..]).expect("parse");
        assert_eq!(decoded, root);
        assert_eq!(coordinator.get_tfs(), root);
    }

    #[test]
    fn write_toc_stamps_hidden_track_modes() {
        let (coordinator, device) = coordinator_with(SimDevice::with_tracks(&[
            (Some("music"), TrackEncoding::Sp, 10),
            (Some("h_fs_00"), TrackEncoding::Lp2, 1),
        ]));

        coordinator.write_toc(&FsDirectory::new("")).expect("write_toc");

        let toc = coordinator.read_toc().expect("toc");
        let mode = toc.first_fragment_mode(TrackIndex(1)).expect("fragment");
        assert_eq!(mode & F_SP_MODE, F_SP_MODE);
        assert_eq!(mode & F_STEREO, F_STEREO);
        assert_eq!(mode & F_WRITABLE, 0);
        // The ordinary audio track keeps its writable bit.
        let audio_mode = toc.first_fragment_mode(TrackIndex(0)).expect("fragment");
        assert_eq!(audio_mode & F_WRITABLE, F_WRITABLE);
        drop(device);
    }

    #[test]
    fn oversized_overlay_never_touches_the_device() {
        let (coordinator, device) = coordinator_with(SimDevice::new());
        let mut root = FsDirectory::new("");
        for i in 0..=255_u8 {
            root.add(FsNode::File(FsFile::new(
                TrackId(i),
                format!("file-{i:03}-{}", "n".repeat(30)),
                1,
            )));
        }

        let result = coordinator.write_toc(&root);
        assert!(matches!(
            result,
            Err(mdfs_error::MdfsError::TfsOverflow { .. })
        ));
        assert_eq!(device.utoc_write_count(), 0);
        assert_eq!(device.commit_count(), 0);
    }

    #[test]
    fn write_file_track_pads_to_minimum() {
        let (coordinator, device) = coordinator_with(SimDevice::new());
        coordinator
            .write_file_track(TrackId(0), &[0xDE, 0xAD, 0xBE, 0xEF])
            .expect("upload");

        let uploads = device.upload_log();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].title, "h_fs_00");
        assert_eq!(uploads[0].format, WireFormat::Lp2);
        assert_eq!(uploads[0].data.len(), MIN_HIDDEN_TRACK_BYTES);
        assert_eq!(&uploads[0].data[..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(uploads[0].data[4..].iter().all(|b| *b == 0));
    }

    #[test]
    fn rewrite_erases_then_uploads() {
        let (coordinator, device) = coordinator_with(SimDevice::with_tracks(&[(
            Some("h_fs_05"),
            TrackEncoding::Lp2,
            1,
        )]));
        coordinator
            .rewrite_file_track(Some(TrackIndex(0)), TrackId(5), &[1, 2, 3])
            .expect("rewrite");

        assert_eq!(device.erase_log(), vec![0]);
        let tracks = coordinator.list_tracks().expect("list");
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].title.as_deref(), Some("h_fs_05"));
    }

    #[test]
    fn read_transfer_filters_and_seals() {
        let (coordinator, _device) = coordinator_with(SimDevice::with_tracks(&[(
            Some("song"),
            TrackEncoding::Sp,
            2,
        )]));
        let buffer = Arc::new(TrackBuffer::new());
        assert!(buffer.try_claim_fill());

        coordinator.start_read_transfer(TrackIndex(0), DownloadConfig::audio(), Arc::clone(&buffer));
        buffer.wait_for(usize::MAX - 1);
        assert!(buffer.is_complete());
        // 2048-byte header + 2 SP sectors of payload; metadata chunk dropped.
        assert_eq!(buffer.len(), 2048 + 2 * 2332);
    }

    #[test]
    fn failed_transfer_still_seals_the_buffer() {
        let (coordinator, device) = coordinator_with(SimDevice::with_tracks(&[(
            Some("song"),
            TrackEncoding::Lp2,
            4,
        )]));
        device.fail_download_after(1);
        let buffer = Arc::new(TrackBuffer::new());
        assert!(buffer.try_claim_fill());

        coordinator.start_read_transfer(TrackIndex(0), DownloadConfig::audio(), Arc::clone(&buffer));
        let outcome = buffer.wait_for(usize::MAX - 1);
        assert_eq!(outcome, mdfs_stream::WaitOutcome::Complete);
        assert!(buffer.len() < 4 * 2112);
    }
}
