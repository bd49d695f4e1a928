//! Backing Storage
//!
//! Sparse files that serve as the storage medium behind loopback devices.

mod backing_store;

pub use backing_store::{BackingFile, BackingStore};
