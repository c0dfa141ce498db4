//! TFS record codec.
//!
//! The record is a flat byte stream:
//!
//! ```text
//! TFS        := MAGIC DirRecord
//! MAGIC      := 8C B3 96 E9 8D A2
//! DirRecord  := 0xF0 NameZ Record* 0xFF
//! Record     := FileRecord | DirRecord
//! FileRecord := typ(1) trackID(1) length(typ+1 bytes, big-endian) NameZ
//! NameZ      := UTF-8 bytes, no 0x00, terminated by 0x00
//! ```
//!
//! `typ ∈ {0,1,2,3}` selects the narrowest length field that represents the
//! file size. The encoded record must fit the 2300-byte budget of the UTOC
//! region; a larger tree fails with [`EncodeError::Overflow`] before anything
//! touches the device.

use crate::tree::{FsDirectory, FsFile, FsNode};
use mdfs_error::MdfsError;
use mdfs_types::{read_be_uint, read_u8, ParseError, TrackId, TFS_MAGIC, TFS_MAX_LEN};
use thiserror::Error;

const DIR_OPEN: u8 = 0xF0;
const DIR_CLOSE: u8 = 0xFF;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("encoded overlay record is {encoded} bytes, over the {TFS_MAX_LEN}-byte budget")]
    Overflow { encoded: usize },
    #[error("name {name:?} contains a NUL byte")]
    NulInName { name: String },
    #[error("file name {name:?} contains '/'")]
    SlashInName { name: String },
}

impl From<EncodeError> for MdfsError {
    fn from(err: EncodeError) -> Self {
        match err {
            EncodeError::Overflow { encoded } => Self::TfsOverflow {
                encoded,
                max: TFS_MAX_LEN,
            },
            EncodeError::NulInName { .. } => Self::Format(ParseError::InvalidField {
                field: "name",
                reason: "contains NUL",
            }),
            EncodeError::SlashInName { .. } => Self::Format(ParseError::InvalidField {
                field: "name",
                reason: "contains '/'",
            }),
        }
    }
}

/// Encode `root` as a TFS record, magic included.
pub fn encode(root: &FsDirectory) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(&TFS_MAGIC);
    encode_directory(root, &mut out)?;
    if out.len() > TFS_MAX_LEN {
        return Err(EncodeError::Overflow {
            encoded: out.len(),
        });
    }
    Ok(out)
}

fn encode_directory(dir: &FsDirectory, out: &mut Vec<u8>) -> Result<(), EncodeError> {
    out.push(DIR_OPEN);
    push_name(&dir.name, false, out)?;
    for child in dir.children.values() {
        match child {
            FsNode::Directory(sub) => encode_directory(sub, out)?,
            FsNode::File(file) => encode_file(file, out)?,
        }
    }
    out.push(DIR_CLOSE);
    Ok(())
}

fn encode_file(file: &FsFile, out: &mut Vec<u8>) -> Result<(), EncodeError> {
    let typ = length_type(file.byte_length);
    out.push(typ);
    out.push(file.id.0);
    let width = usize::from(typ) + 1;
    let be = file.byte_length.to_be_bytes();
    out.extend_from_slice(&be[4 - width..]);
    push_name(&file.name, true, out)
}

fn push_name(name: &str, reject_slash: bool, out: &mut Vec<u8>) -> Result<(), EncodeError> {
    if name.as_bytes().contains(&0) {
        return Err(EncodeError::NulInName {
            name: name.to_owned(),
        });
    }
    if reject_slash && name.contains('/') {
        return Err(EncodeError::SlashInName {
            name: name.to_owned(),
        });
    }
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    Ok(())
}

/// Narrowest length-field selector for a file size.
fn length_type(byte_length: u32) -> u8 {
    if byte_length <= 0xFF {
        0
    } else if byte_length <= 0xFFFF {
        1
    } else if byte_length <= 0xFF_FFFF {
        2
    } else {
        3
    }
}

/// Parse a TFS record (magic included) into its root directory.
pub fn parse(data: &[u8]) -> Result<FsDirectory, ParseError> {
    let magic = read_be_uint(data, 0, TFS_MAGIC.len())?;
    let expected = read_be_uint(&TFS_MAGIC, 0, TFS_MAGIC.len())?;
    if magic != expected {
        return Err(ParseError::InvalidMagic {
            expected,
            actual: magic,
        });
    }

    let mut pos = TFS_MAGIC.len();
    let lead = read_u8(data, pos)?;
    if lead != DIR_OPEN {
        return Err(ParseError::UnexpectedByte {
            offset: pos,
            value: lead,
        });
    }
    pos += 1;
    parse_directory(data, &mut pos)
}

fn parse_directory(data: &[u8], pos: &mut usize) -> Result<FsDirectory, ParseError> {
    let name = parse_name(data, pos)?;
    let mut dir = FsDirectory::new(name);
    loop {
        let lead = read_u8(data, *pos)?;
        *pos += 1;
        match lead {
            DIR_CLOSE => return Ok(dir),
            DIR_OPEN => {
                let sub = parse_directory(data, pos)?;
                dir.add(FsNode::Directory(sub));
            }
            typ @ 0..=3 => {
                let file = parse_file(data, pos, typ)?;
                dir.add(FsNode::File(file));
            }
            value => {
                return Err(ParseError::UnexpectedByte {
                    offset: *pos - 1,
                    value,
                })
            }
        }
    }
}

fn parse_file(data: &[u8], pos: &mut usize, typ: u8) -> Result<FsFile, ParseError> {
    let id = TrackId(read_u8(data, *pos)?);
    *pos += 1;
    let width = usize::from(typ) + 1;
    let length = read_be_uint(data, *pos, width)?;
    *pos += width;
    let byte_length = u32::try_from(length).map_err(|_| ParseError::InvalidField {
        field: "length",
        reason: "exceeds u32",
    })?;
    let name = parse_name(data, pos)?;
    Ok(FsFile::new(id, name, byte_length))
}

fn parse_name(data: &[u8], pos: &mut usize) -> Result<String, ParseError> {
    let rest = &data[(*pos).min(data.len())..];
    let Some(nul) = rest.iter().position(|b| *b == 0) else {
        return Err(ParseError::InvalidField {
            field: "name",
            reason: "unterminated",
        });
    };
    let name = std::str::from_utf8(&rest[..nul]).map_err(|_| ParseError::InvalidField {
        field: "name",
        reason: "invalid UTF-8",
    })?;
    *pos += nul + 1;
    Ok(name.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(id: u8, name: &str, len: u32) -> FsNode {
        FsNode::File(FsFile::new(TrackId(id), name, len))
    }

    #[test]
    fn empty_root_is_magic_plus_three_bytes() {
        let encoded = encode(&FsDirectory::new("")).expect("encode");
        assert_eq!(encoded.len(), TFS_MAGIC.len() + 3);
        assert_eq!(&encoded[..6], &TFS_MAGIC);
        assert_eq!(&encoded[6..], &[0xF0, 0x00, 0xFF]);
    }

    #[test]
    fn length_field_width_selection() {
        // 0xFF → typ 0 with a single length byte.
        let mut root = FsDirectory::new("");
        root.add(file(0, "f", 0xFF));
        let encoded = encode(&root).expect("encode");
        assert_eq!(&encoded[8..13], &[0x00, 0x00, 0xFF, b'f', 0x00]);

        // 0x100 → typ 1 with two length bytes.
        let mut root = FsDirectory::new("");
        root.add(file(0, "f", 0x100));
        let encoded = encode(&root).expect("encode");
        assert_eq!(&encoded[8..14], &[0x01, 0x00, 0x01, 0x00, b'f', 0x00]);

        // 0x10000 → typ 2 with three length bytes.
        let mut root = FsDirectory::new("");
        root.add(file(0, "f", 0x10000));
        let encoded = encode(&root).expect("encode");
        assert_eq!(&encoded[8..15], &[0x02, 0x00, 0x01, 0x00, 0x00, b'f', 0x00]);
    }

    #[test]
    fn round_trip_nested_tree() {
        let mut sub = FsDirectory::new("nested");
        sub.add(file(2, "inner.dat", 0x12345));
        sub.add(FsNode::Directory(FsDirectory::new("empty")));
        let mut root = FsDirectory::new("");
        root.add(file(0, "a.bin", 4));
        root.add(file(0xAB, "b £ unicode", 0xFFFF));
        root.add(FsNode::Directory(sub));

        let encoded = encode(&root).expect("encode");
        let decoded = parse(&encoded).expect("parse");
        assert_eq!(decoded, root);
    }

    #[test]
    fn overflow_is_rejected() {
        let mut root = FsDirectory::new("");
        // Each entry costs ~40 bytes; 64 of them exceed the 2300-byte budget.
        for i in 0..64_u8 {
            root.add(file(i, &format!("padded-name-{i:03}-{}", "x".repeat(24)), 1));
        }
        match encode(&root) {
            Err(EncodeError::Overflow { encoded }) => assert!(encoded > TFS_MAX_LEN),
            other => panic!("expected overflow, got {other:?}"),
        }
    }

    #[test]
    fn magic_mismatch_is_fatal() {
        let mut encoded = encode(&FsDirectory::new("")).expect("encode");
        encoded[0] ^= 0xFF;
        assert!(matches!(
            parse(&encoded),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn stray_lead_byte_is_rejected() {
        let mut root = FsDirectory::new("");
        root.add(file(1, "f", 1));
        let mut encoded = encode(&root).expect("encode");
        // Corrupt the file record's typ byte into an undefined lead value.
        encoded[8] = 0x77;
        assert!(matches!(
            parse(&encoded),
            Err(ParseError::UnexpectedByte { value: 0x77, .. })
        ));
    }

    #[test]
    fn truncated_record_is_rejected() {
        let mut root = FsDirectory::new("");
        root.add(file(1, "file.bin", 300));
        let encoded = encode(&root).expect("encode");
        for cut in [encoded.len() - 1, 7, 9] {
            assert!(parse(&encoded[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn nul_in_name_fails_encode() {
        let mut root = FsDirectory::new("");
        root.add(file(0, "bad\0name", 1));
        assert!(matches!(
            encode(&root),
            Err(EncodeError::NulInName { .. })
        ));
    }

    #[test]
    fn slash_in_file_name_fails_encode() {
        let mut root = FsDirectory::new("");
        root.add(file(0, "bad/name", 1));
        assert!(matches!(
            encode(&root),
            Err(EncodeError::SlashInName { .. })
        ));
    }
}
