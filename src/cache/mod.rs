//! Tiered object cache storage engine.
//!
//! This module contains the core data structures and algorithms:
//! - [`key`]: fixed-size content keys
//! - [`block`]: mmap-backed storage blocks, write reservations, read handles
//! - [`index`]: item records and the snapshot-persisted meta index
//! - [`store`]: per-tier allocation, lookup, deletion, FIFO eviction
//! - [`manager`]: cross-tier placement, promotion on read, batch deletion

pub mod block;
pub mod index;
pub mod key;
pub mod manager;
pub mod store;
