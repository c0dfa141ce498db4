#![forbid(unsafe_code)]
//! mdfs public API facade.
//!
//! Re-exports the engine from `mdfs-core` plus the host-facing overlay
//! adapter. This is the crate downstream consumers (CLI, tooling) depend on.

pub use mdfs_core::*;
pub use mdfs_vfs::Overlay;
