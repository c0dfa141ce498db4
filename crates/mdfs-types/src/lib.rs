#![forbid(unsafe_code)]
//! Shared vocabulary for the mdfs workspace: disc geometry constants, the
//! hidden-track naming convention, and the byte-parsing primitives the codec
//! crates build on.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Raw size of one UTOC sector in bytes.
pub const SECTOR_SIZE: usize = 2352;

/// Number of UTOC sectors the driver exposes (0, 1 and 2).
pub const UTOC_SECTOR_COUNT: u8 = 3;

/// Byte offset of the overlay record inside UTOC sector 2 (0x2F + 1 + 255).
pub const TFS_OFFSET: usize = 0x130;

/// Maximum encoded size of the overlay record.
pub const TFS_MAX_LEN: usize = 2300;

/// Signature the overlay record starts with.
pub const TFS_MAGIC: [u8; 6] = [0x8C, 0xB3, 0x96, 0xE9, 0x8D, 0xA2];

/// Title prefix of tracks that back overlay files.
pub const HIDDEN_TITLE_PREFIX: &str = "h_fs_";

/// Bytes of audio payload per SP sector.
pub const SP_SECTOR_BYTES: u64 = 2332;

/// Padding bytes per LP sector (20 per 212-byte sound frame, 11 frames).
pub const LP_SECTOR_PADDING: u64 = 220;

/// Header size prepended to recovered SP audio (AEA header).
pub const SP_HEADER_BYTES: u64 = 2048;

/// Header size prepended to recovered LP audio (WAV header).
pub const LP_HEADER_BYTES: u64 = 48;

/// Minimum payload size of an uploaded hidden track.
pub const MIN_HIDDEN_TRACK_BYTES: usize = 2112;

/// Identifier of an overlay file, doubling as the hidden-track name suffix.
///
/// The id space is 0..=255; the backing disc track is titled
/// `h_fs_{id:02x}` (lowercase hex, zero-padded to two digits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackId(pub u8);

impl TrackId {
    /// Title of the disc track backing this id.
    #[must_use]
    pub fn hidden_title(self) -> String {
        format!("{HIDDEN_TITLE_PREFIX}{:02x}", self.0)
    }

    /// Parse a disc-track title as a hidden-track name.
    ///
    /// Strict: exactly two lowercase hex digits after the prefix. Anything
    /// else is an ordinary audio title.
    #[must_use]
    pub fn from_hidden_title(title: &str) -> Option<Self> {
        let suffix = title.strip_prefix(HIDDEN_TITLE_PREFIX)?;
        if suffix.len() != 2
            || !suffix
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return None;
        }
        u8::from_str_radix(suffix, 16).ok().map(Self)
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}", self.0)
    }
}

/// Zero-based position of a track on the disc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackIndex(pub u16);

impl TrackIndex {
    #[must_use]
    pub fn as_usize(self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for TrackIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("unexpected byte {value:#04x} at offset {offset}")]
    UnexpectedByte { offset: usize, value: u8 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    Ok(ensure_slice(data, offset, 1)?[0])
}

/// Read a big-endian unsigned integer of `width` bytes (1..=8).
#[inline]
pub fn read_be_uint(data: &[u8], offset: usize, width: usize) -> Result<u64, ParseError> {
    if width == 0 || width > 8 {
        return Err(ParseError::InvalidField {
            field: "width",
            reason: "must be 1..=8",
        });
    }
    let bytes = ensure_slice(data, offset, width)?;
    let mut value = 0_u64;
    for byte in bytes {
        value = (value << 8) | u64::from(*byte);
    }
    Ok(value)
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Decode a NUL-padded byte field into a trimmed string.
#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hidden_title_round_trips() {
        for raw in [0_u8, 0x0a, 0x7f, 0xff] {
            let id = TrackId(raw);
            assert_eq!(TrackId::from_hidden_title(&id.hidden_title()), Some(id));
        }
        assert_eq!(TrackId(0).hidden_title(), "h_fs_00");
        assert_eq!(TrackId(0xAB).hidden_title(), "h_fs_ab");
    }

    #[test]
    fn hidden_title_parse_is_strict() {
        for title in [
            "h_fs_",
            "h_fs_0",
            "h_fs_000",
            "h_fs_AB",
            "h_fs_g0",
            "H_FS_00",
            "music",
            "",
        ] {
            assert_eq!(TrackId::from_hidden_title(title), None, "title {title:?}");
        }
    }

    #[test]
    fn be_uint_widths() {
        let data = [0x01, 0x02, 0x03, 0x04];
        assert_eq!(read_be_uint(&data, 0, 1).unwrap(), 0x01);
        assert_eq!(read_be_uint(&data, 0, 2).unwrap(), 0x0102);
        assert_eq!(read_be_uint(&data, 1, 3).unwrap(), 0x0203_04);
        assert!(read_be_uint(&data, 2, 3).is_err());
        assert!(read_be_uint(&data, 0, 0).is_err());
    }

    #[test]
    fn ensure_slice_bounds() {
        let data = [0_u8; 4];
        assert!(ensure_slice(&data, 0, 4).is_ok());
        assert!(ensure_slice(&data, 4, 0).is_ok());
        assert!(matches!(
            ensure_slice(&data, 2, 3),
            Err(ParseError::InsufficientData {
                needed: 3,
                offset: 2,
                actual: 2
            })
        ));
        assert!(ensure_slice(&data, usize::MAX, 2).is_err());
    }

    #[test]
    fn nul_padding_is_trimmed() {
        assert_eq!(trim_nul_padded(b"abc\0\0\0"), "abc");
        assert_eq!(trim_nul_padded(b"abc"), "abc");
        assert_eq!(trim_nul_padded(b"\0abc"), "");
    }
}
