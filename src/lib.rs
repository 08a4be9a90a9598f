//! object-cache-tier: a tiered, content-addressed object cache.
//!
//! Clients store and fetch opaque byte objects (header + body) by a
//! fixed-size key across up to three storage tiers of decreasing speed and
//! increasing capacity:
//!   mem (tmpfs) → ssd → hdd
//!
//! Objects are appended into memory-mapped blocks, the unit of allocation
//! and of FIFO eviction. Writes land in the slowest configured tier; a read
//! hit promotes the object into every faster tier. The protocol layer on
//! top of this engine copies request/response payloads directly into and
//! out of block memory (zero-copy on the hot path).

pub mod cache;
pub mod config;
pub mod error;

pub use cache::block::{ItemHandle, WriteReservation};
pub use cache::index::{ItemRecord, MetaIndex, MAX_RAW_KEY_LEN};
pub use cache::key::Key;
pub use cache::manager::{CacheHit, Tier, TierManager};
pub use cache::store::{Store, StoreStats};
pub use config::{Config, TierConfig, TiersConfig};
pub use error::CacheError;
