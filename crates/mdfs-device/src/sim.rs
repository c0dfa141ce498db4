//! In-memory NetMD device.
//!
//! Backs the integration tests and the demo mount. The disc is a set of UTOC
//! sectors (kept as real bytes, built with the [`toc`](crate::toc) codec)
//! plus one payload vector per track. Payloads are stored post-recovery:
//! LP frame padding already stripped, headers synthesized on download.
//!
//! Every mutating operation is logged so tests can assert on the exact
//! device traffic.

use crate::toc::{parse_toc, reconstruct_toc, Toc, F_SP_MODE, F_STEREO, F_WRITABLE};
use crate::{
    ChunkKind, DiscState, DownloadChunk, DownloadConfig, NetMdDevice, TrackEncoding, TrackInfo,
    WireFormat,
};
use mdfs_error::{MdfsError, Result};
use mdfs_types::{TrackIndex, LP_HEADER_BYTES, MIN_HIDDEN_TRACK_BYTES, SECTOR_SIZE, SP_HEADER_BYTES};
use parking_lot::Mutex;
use tracing::debug;

const DOWNLOAD_CHUNK_BYTES: usize = 0x400;

/// One recorded `upload_track` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRecord {
    pub title: String,
    pub format: WireFormat,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct SimState {
    /// Staged (in-memory) UTOC sectors, three of them.
    staged: [Vec<u8>; 3],
    /// Last committed UTOC, updated by `force_toc_commit`.
    committed: [Vec<u8>; 3],
    payloads: Vec<Vec<u8>>,
    uploads: Vec<UploadRecord>,
    erases: Vec<u16>,
    commit_count: u32,
    utoc_write_count: u32,
    download_count: u32,
    /// When set, downloads fail after emitting this many audio chunks.
    fail_download_after: Option<usize>,
}

/// Simulated disc + recorder deck.
#[derive(Debug)]
pub struct SimDevice {
    state: Mutex<SimState>,
}

impl SimDevice {
    /// Blank disc: empty TOC, zeroed sector 2 (unformatted overlay).
    #[must_use]
    pub fn new() -> Self {
        Self::from_toc(Toc::empty(), Vec::new())
    }

    /// Disc seeded with `(title, encoding, sectors)` tracks.
    #[must_use]
    pub fn with_tracks(specs: &[(Option<&str>, TrackEncoding, u32)]) -> Self {
        let mut toc = Toc::empty();
        let mut payloads = Vec::new();
        for (title, encoding, sectors) in specs {
            let mode = match encoding {
                TrackEncoding::Sp => F_SP_MODE | F_STEREO | F_WRITABLE,
                TrackEncoding::Lp2 | TrackEncoding::Lp4 => F_STEREO | F_WRITABLE,
            };
            toc.add_track(title.unwrap_or(""), *sectors, mode);
            let payload_len = *sectors as usize * sector_payload_bytes(*encoding);
            payloads.push(vec![0_u8; payload_len]);
        }
        Self::from_toc(toc, payloads)
    }

    fn from_toc(toc: Toc, payloads: Vec<Vec<u8>>) -> Self {
        let [sector0, sector1] = reconstruct_toc(&toc);
        let staged = [sector0, sector1, vec![0_u8; SECTOR_SIZE]];
        Self {
            state: Mutex::new(SimState {
                committed: staged.clone(),
                staged,
                payloads,
                uploads: Vec::new(),
                erases: Vec::new(),
                commit_count: 0,
                utoc_write_count: 0,
                download_count: 0,
                fail_download_after: None,
            }),
        }
    }

    /// Overwrite a staged UTOC sector (test seeding).
    pub fn seed_utoc_sector(&self, sector: u8, bytes: Vec<u8>) {
        let mut state = self.state.lock();
        state.staged[usize::from(sector)] = bytes;
        state.committed = state.staged.clone();
    }

    /// Store a specific payload for an existing track (test seeding).
    pub fn seed_payload(&self, index: TrackIndex, payload: Vec<u8>) {
        self.state.lock().payloads[index.as_usize()] = payload;
    }

    /// Make the next download fail after `chunks` audio chunks.
    pub fn fail_download_after(&self, chunks: usize) {
        self.state.lock().fail_download_after = Some(chunks);
    }

    #[must_use]
    pub fn upload_log(&self) -> Vec<UploadRecord> {
        self.state.lock().uploads.clone()
    }

    #[must_use]
    pub fn erase_log(&self) -> Vec<u16> {
        self.state.lock().erases.clone()
    }

    #[must_use]
    pub fn commit_count(&self) -> u32 {
        self.state.lock().commit_count
    }

    #[must_use]
    pub fn utoc_write_count(&self) -> u32 {
        self.state.lock().utoc_write_count
    }

    #[must_use]
    pub fn download_count(&self) -> u32 {
        self.state.lock().download_count
    }

    #[must_use]
    pub fn staged_sector(&self, sector: u8) -> Vec<u8> {
        self.state.lock().staged[usize::from(sector)].clone()
    }

    #[must_use]
    pub fn committed_sector(&self, sector: u8) -> Vec<u8> {
        self.state.lock().committed[usize::from(sector)].clone()
    }

    fn parse_staged(state: &SimState) -> Result<Toc> {
        Ok(parse_toc(&state.staged[0], &state.staged[1])?)
    }
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn sector_payload_bytes(encoding: TrackEncoding) -> usize {
    match encoding {
        TrackEncoding::Sp => 2332,
        TrackEncoding::Lp2 | TrackEncoding::Lp4 => 2112,
    }
}

fn track_encoding(toc: &Toc, index: TrackIndex) -> TrackEncoding {
    match toc.first_fragment_mode(index) {
        Some(mode) if mode & F_SP_MODE != 0 => TrackEncoding::Sp,
        _ => TrackEncoding::Lp2,
    }
}

impl NetMdDevice for SimDevice {
    fn list_tracks(&self) -> Result<Vec<TrackInfo>> {
        let state = self.state.lock();
        let toc = Self::parse_staged(&state)?;
        let mut tracks = Vec::with_capacity(usize::from(toc.n_tracks));
        for i in 0..u16::from(toc.n_tracks) {
            let index = TrackIndex(i);
            tracks.push(TrackInfo {
                index,
                title: toc.title(index),
                encoding: track_encoding(&toc, index),
            });
        }
        Ok(tracks)
    }

    fn disc_state(&self) -> Result<DiscState> {
        let state = self.state.lock();
        let toc = Self::parse_staged(&state)?;
        Ok(DiscState {
            title: None,
            track_count: u16::from(toc.n_tracks),
            writable: true,
        })
    }

    fn read_utoc_sector(&self, sector: u8) -> Result<Vec<u8>> {
        let state = self.state.lock();
        state
            .staged
            .get(usize::from(sector))
            .cloned()
            .ok_or_else(|| MdfsError::Device(format!("no UTOC sector {sector}")))
    }

    fn write_utoc_sector(&self, sector: u8, bytes: &[u8]) -> Result<()> {
        if bytes.len() != SECTOR_SIZE {
            return Err(MdfsError::Device(format!(
                "UTOC sector write of {} bytes, expected {SECTOR_SIZE}",
                bytes.len()
            )));
        }
        let mut state = self.state.lock();
        if usize::from(sector) >= state.staged.len() {
            return Err(MdfsError::Device(format!("no UTOC sector {sector}")));
        }
        state.staged[usize::from(sector)] = bytes.to_vec();
        state.utoc_write_count += 1;
        Ok(())
    }

    fn erase_track(&self, index: TrackIndex) -> Result<()> {
        let mut state = self.state.lock();
        let mut toc = Self::parse_staged(&state)?;
        if !toc.remove_track(index) {
            return Err(MdfsError::Device(format!("erase of missing track {index}")));
        }
        let [sector0, sector1] = reconstruct_toc(&toc);
        state.staged[0] = sector0;
        state.staged[1] = sector1;
        state.committed[0] = state.staged[0].clone();
        state.committed[1] = state.staged[1].clone();
        state.payloads.remove(index.as_usize());
        state.erases.push(index.0);
        debug!(target: "mdfs::sim", index = index.0, "erase_track");
        Ok(())
    }

    fn download_track(
        &self,
        index: TrackIndex,
        config: &DownloadConfig,
        sink: &mut dyn FnMut(DownloadChunk) -> Result<()>,
    ) -> Result<()> {
        let (payload, encoding, fail_after) = {
            let mut state = self.state.lock();
            state.download_count += 1;
            let toc = Self::parse_staged(&state)?;
            let payload = state
                .payloads
                .get(index.as_usize())
                .cloned()
                .ok_or_else(|| MdfsError::Device(format!("download of missing track {index}")))?;
            (payload, track_encoding(&toc, index), state.fail_download_after.take())
        };

        // The driver interleaves status frames; the coordinator must drop them.
        sink(DownloadChunk {
            kind: ChunkKind::Metadata,
            data: vec![0_u8; 4],
        })?;

        if config.include_header {
            let header_len = if encoding.is_sp() {
                SP_HEADER_BYTES
            } else {
                LP_HEADER_BYTES
            };
            sink(DownloadChunk {
                kind: ChunkKind::Header,
                data: vec![0_u8; header_len as usize],
            })?;
        }

        for (emitted, chunk) in payload.chunks(DOWNLOAD_CHUNK_BYTES).enumerate() {
            if let Some(limit) = fail_after {
                if emitted >= limit {
                    return Err(MdfsError::Device("recovery stream stalled".to_owned()));
                }
            }
            sink(DownloadChunk {
                kind: ChunkKind::AudioData,
                data: chunk.to_vec(),
            })?;
        }
        Ok(())
    }

    fn upload_track(&self, title: &str, format: WireFormat, data: &[u8]) -> Result<()> {
        if !matches!(format, WireFormat::Lp2) {
            return Err(MdfsError::Device(format!(
                "unsupported upload format {format:?}"
            )));
        }
        let mut state = self.state.lock();
        let mut toc = Self::parse_staged(&state)?;
        let sectors = data.len().max(MIN_HIDDEN_TRACK_BYTES).div_ceil(2112) as u32;
        toc.add_track(title, sectors, F_STEREO | F_WRITABLE)
            .ok_or_else(|| MdfsError::Device("disc track table full".to_owned()))?;
        let [sector0, sector1] = reconstruct_toc(&toc);
        state.staged[0] = sector0;
        state.staged[1] = sector1;
        state.committed[0] = state.staged[0].clone();
        state.committed[1] = state.staged[1].clone();
        state.payloads.push(data.to_vec());
        state.uploads.push(UploadRecord {
            title: title.to_owned(),
            format,
            data: data.to_vec(),
        });
        debug!(target: "mdfs::sim", title, bytes = data.len(), "upload_track");
        Ok(())
    }

    fn force_toc_commit(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.committed = state.staged.clone();
        state.commit_count += 1;
        debug!(target: "mdfs::sim", "force_toc_commit");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_disc_lists_nothing() {
        let device = SimDevice::new();
        assert!(device.list_tracks().expect("list").is_empty());
        assert_eq!(device.disc_state().expect("state").track_count, 0);
        assert_eq!(device.read_utoc_sector(2).expect("sector").len(), SECTOR_SIZE);
    }

    #[test]
    fn seeded_tracks_round_trip_through_listing() {
        let device = SimDevice::with_tracks(&[
            (Some("Hello/World"), TrackEncoding::Sp, 40),
            (Some("h_fs_00"), TrackEncoding::Lp2, 1),
            (None, TrackEncoding::Lp2, 3),
        ]);
        let tracks = device.list_tracks().expect("list");
        assert_eq!(tracks.len(), 3);
        assert_eq!(tracks[0].title.as_deref(), Some("Hello/World"));
        assert_eq!(tracks[0].encoding, TrackEncoding::Sp);
        assert_eq!(tracks[1].title.as_deref(), Some("h_fs_00"));
        assert_eq!(tracks[2].title, None);
        assert_eq!(tracks[2].encoding, TrackEncoding::Lp2);
    }

    #[test]
    fn upload_appends_and_erase_renumbers() {
        let device = SimDevice::with_tracks(&[(Some("music"), TrackEncoding::Sp, 10)]);
        device
            .upload_track("h_fs_00", WireFormat::Lp2, &[1_u8; 2112])
            .expect("upload");
        let tracks = device.list_tracks().expect("list");
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[1].title.as_deref(), Some("h_fs_00"));

        device.erase_track(TrackIndex(0)).expect("erase");
        let tracks = device.list_tracks().expect("list");
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].title.as_deref(), Some("h_fs_00"));
        assert_eq!(device.erase_log(), vec![0]);
    }

    #[test]
    fn download_emits_header_only_for_audio_config() {
        let device = SimDevice::with_tracks(&[(Some("song"), TrackEncoding::Sp, 1)]);
        device.seed_payload(TrackIndex(0), vec![9_u8; 2332]);

        let mut kinds = Vec::new();
        device
            .download_track(TrackIndex(0), &DownloadConfig::audio(), &mut |chunk| {
                kinds.push((chunk.kind, chunk.data.len()));
                Ok(())
            })
            .expect("download");
        assert_eq!(kinds[0].0, ChunkKind::Metadata);
        assert_eq!(kinds[1], (ChunkKind::Header, 2048));
        assert!(kinds[2..].iter().all(|(kind, _)| *kind == ChunkKind::AudioData));

        let mut kinds = Vec::new();
        device
            .download_track(TrackIndex(0), &DownloadConfig::hidden(), &mut |chunk| {
                kinds.push(chunk.kind);
                Ok(())
            })
            .expect("download");
        assert!(!kinds.contains(&ChunkKind::Header));
    }

    #[test]
    fn injected_failure_interrupts_stream() {
        let device = SimDevice::with_tracks(&[(Some("song"), TrackEncoding::Lp2, 4)]);
        device.fail_download_after(2);
        let mut audio_chunks = 0;
        let result = device.download_track(TrackIndex(0), &DownloadConfig::audio(), &mut |chunk| {
            if chunk.kind == ChunkKind::AudioData {
                audio_chunks += 1;
            }
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(audio_chunks, 2);
    }

    #[test]
    fn commit_snapshots_staged_sectors() {
        let device = SimDevice::new();
        let mut sector = vec![0_u8; SECTOR_SIZE];
        sector[0] = 0xEE;
        device.write_utoc_sector(2, &sector).expect("write");
        assert_ne!(device.committed_sector(2), sector);
        device.force_toc_commit().expect("commit");
        assert_eq!(device.committed_sector(2), sector);
        assert_eq!(device.commit_count(), 1);
        assert_eq!(device.utoc_write_count(), 1);
    }
}
