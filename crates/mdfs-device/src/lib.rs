#![forbid(unsafe_code)]
//! Device-driver boundary.
//!
//! The transfer coordinator consumes a [`NetMdDevice`]: USB command framing,
//! ATRAC packet encryption and the raw-recovery exploits live behind it. This
//! crate also carries the UTOC/TOC codec the driver-side helpers expose
//! ([`toc`]) and an in-memory disc ([`sim`]) used by the integration tests
//! and the demo mount.

pub mod sim;
pub mod toc;

use mdfs_error::Result;
use mdfs_types::TrackIndex;
use serde::{Deserialize, Serialize};

/// Audio encoding of a disc track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackEncoding {
    Sp,
    Lp2,
    Lp4,
}

impl TrackEncoding {
    #[must_use]
    pub fn is_sp(self) -> bool {
        matches!(self, Self::Sp)
    }
}

/// One row of the disc's track listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub index: TrackIndex,
    /// `None` for untitled tracks.
    pub title: Option<String>,
    pub encoding: TrackEncoding,
}

/// Snapshot of disc-level state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscState {
    pub title: Option<String>,
    pub track_count: u16,
    pub writable: bool,
}

/// Upload wire format. The overlay only ever uploads LP2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireFormat {
    Sp,
    Lp2,
    Lp4,
}

/// Kind tag on a recovery chunk.
///
/// The coordinator keeps `Header` (audio reads only) and `AudioData`;
/// everything else is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Header,
    AudioData,
    Metadata,
}

/// One chunk yielded by the driver's recovery stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadChunk {
    pub kind: ChunkKind,
    pub data: Vec<u8>,
}

/// Recovery configuration.
///
/// Hidden overlay tracks are recovered as raw payload: LP frame padding is
/// stripped and no header is emitted. Audio recovery includes the header so
/// the result is a playable file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadConfig {
    pub include_header: bool,
    pub strip_padding: bool,
}

impl DownloadConfig {
    /// Configuration for recovering an ordinary audio track.
    #[must_use]
    pub fn audio() -> Self {
        Self {
            include_header: true,
            strip_padding: false,
        }
    }

    /// Configuration for recovering a hidden overlay track.
    #[must_use]
    pub fn hidden() -> Self {
        Self {
            include_header: false,
            strip_padding: true,
        }
    }
}

/// The NetMD device driver.
///
/// All methods are synchronous; serialization of device access is the
/// transfer coordinator's job, not the driver's.
pub trait NetMdDevice: Send + Sync {
    fn list_tracks(&self) -> Result<Vec<TrackInfo>>;

    fn disc_state(&self) -> Result<DiscState>;

    /// Read one 2352-byte UTOC sector (0, 1 or 2).
    fn read_utoc_sector(&self, sector: u8) -> Result<Vec<u8>>;

    /// Overwrite one UTOC sector. `bytes.len()` must equal the sector size.
    fn write_utoc_sector(&self, sector: u8, bytes: &[u8]) -> Result<()>;

    fn erase_track(&self, index: TrackIndex) -> Result<()>;

    /// Stream the raw payload of a track through `sink`, chunk by chunk.
    fn download_track(
        &self,
        index: TrackIndex,
        config: &DownloadConfig,
        sink: &mut dyn FnMut(DownloadChunk) -> Result<()>,
    ) -> Result<()>;

    /// Upload `data` as a new track appended to the disc.
    fn upload_track(&self, title: &str, format: WireFormat, data: &[u8]) -> Result<()>;

    /// Commit the in-memory UTOC to the physical TOC.
    fn force_toc_commit(&self) -> Result<()>;
}

impl<T: NetMdDevice + ?Sized> NetMdDevice for std::sync::Arc<T> {
    fn list_tracks(&self) -> Result<Vec<TrackInfo>> {
        (**self).list_tracks()
    }

    fn disc_state(&self) -> Result<DiscState> {
        (**self).disc_state()
    }

    fn read_utoc_sector(&self, sector: u8) -> Result<Vec<u8>> {
        (**self).read_utoc_sector(sector)
    }

    fn write_utoc_sector(&self, sector: u8, bytes: &[u8]) -> Result<()> {
        (**self).write_utoc_sector(sector, bytes)
    }

    fn erase_track(&self, index: TrackIndex) -> Result<()> {
        (**self).erase_track(index)
    }

    fn download_track(
        &self,
        index: TrackIndex,
        config: &DownloadConfig,
        sink: &mut dyn FnMut(DownloadChunk) -> Result<()>,
    ) -> Result<()> {
        (**self).download_track(index, config, sink)
    }

    fn upload_track(&self, title: &str, format: WireFormat, data: &[u8]) -> Result<()> {
        (**self).upload_track(title, format, data)
    }

    fn force_toc_commit(&self) -> Result<()> {
        (**self).force_toc_commit()
    }
}
