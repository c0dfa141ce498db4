#![forbid(unsafe_code)]
//! Overlay filesystem model.
//!
//! [`tree`] holds the in-memory directory tree ([`FsNode`]); [`codec`]
//! encodes and decodes the TFS record the tree persists as inside UTOC
//! sector 2.

pub mod codec;
pub mod tree;

pub use codec::{encode, parse, EncodeError};
pub use tree::{FsDirectory, FsFile, FsNode};
