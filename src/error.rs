//! Error types for the cache engine.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the storage engine.
///
/// A lookup miss is not an error; `get` returns `None`. Errors returned from
/// `Store::open` / `TierManager::open` are fatal to startup, everything else
/// is a per-request condition the protocol layer converts to a response
/// status.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid key {0:?}: expected 32 hex chars")]
    InvalidKey(String),

    #[error("raw key is {len} bytes, limit is {limit}")]
    RawKeyTooLong { len: usize, limit: usize },

    #[error("object too large: head {head_len} + body {body_len} bytes")]
    ObjectTooLarge { head_len: u64, body_len: u64 },

    #[error("no storage tiers configured")]
    NoTiersConfigured,

    #[error("index snapshot {path}: {source}")]
    Snapshot {
        path: PathBuf,
        source: serde_json::Error,
    },
}
