#![forbid(unsafe_code)]
//! Core engine of the overlay: the disc cache and the transfer coordinator.
//!
//! The coordinator serializes every device-touching operation behind one
//! lock; the cache keeps the three representations (device state, TOC,
//! overlay tree) consistent and is the only owner of the coordinator.

pub mod cache;
pub mod transfer;

pub use cache::{resolve_hidden, Cache, CacheState};
pub use transfer::TransferCoordinator;
