//! Tier orchestration: write placement, promotion on read, cross-tier
//! deletion.
//!
//! The [`TierManager`] owns up to three stores ordered fastest to slowest
//! (mem, ssd, hdd) and no object data of its own. Writes always land in the
//! slowest configured tier; the fastest tiers are reserved for content
//! proven hot by being read, so their churn is bounded to actually-requested
//! objects. A read hit in a slower tier is copied into every faster tier
//! before being returned (promotion on read).

use std::fmt;

use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cache::block::{ItemHandle, WriteReservation};
use crate::cache::index::ItemRecord;
use crate::cache::key::Key;
use crate::cache::store::{Store, StoreStats};
use crate::config::Config;
use crate::error::CacheError;

/// One of the up-to-three storage tiers, ordered by speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Memory-backed (tmpfs) tier.
    Mem,
    /// Solid-state tier.
    Ssd,
    /// Spinning-disk tier.
    Hdd,
}

impl Tier {
    /// All tiers, fastest first.
    pub const ALL: [Tier; 3] = [Tier::Mem, Tier::Ssd, Tier::Hdd];

    /// Numeric tier level (lower = faster).
    pub fn level(&self) -> u8 {
        match self {
            Tier::Mem => 0,
            Tier::Ssd => 1,
            Tier::Hdd => 2,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Mem => write!(f, "mem"),
            Tier::Ssd => write!(f, "ssd"),
            Tier::Hdd => write!(f, "hdd"),
        }
    }
}

/// A successful lookup: the record, the payload bytes, and the tier the
/// item was found in (before any promotion).
#[derive(Debug)]
pub struct CacheHit {
    pub record: ItemRecord,
    pub data: ItemHandle,
    pub tier: Tier,
}

/// Owns the configured stores and routes operations across them.
#[derive(Debug)]
pub struct TierManager {
    stores: [Option<RwLock<Store>>; 3],
}

impl TierManager {
    /// Open every configured tier. Zero configured tiers is a fatal
    /// configuration error.
    pub fn open(config: &Config) -> Result<Self, CacheError> {
        let tiers = &config.tiers;
        let open_one = |tier: Tier, cfg: &Option<crate::config::TierConfig>| {
            cfg.as_ref()
                .map(|c| Store::open(tier, c).map(RwLock::new))
                .transpose()
        };

        let stores = [
            open_one(Tier::Mem, &tiers.mem)?,
            open_one(Tier::Ssd, &tiers.ssd)?,
            open_one(Tier::Hdd, &tiers.hdd)?,
        ];
        if stores.iter().all(Option::is_none) {
            return Err(CacheError::NoTiersConfigured);
        }

        let configured: Vec<String> = Tier::ALL
            .iter()
            .zip(&stores)
            .filter(|(_, s)| s.is_some())
            .map(|(t, _)| t.to_string())
            .collect();
        info!(tiers = ?configured, "tier manager open");

        Ok(Self { stores })
    }

    /// Dump every tier's index snapshot.
    pub async fn close(&self) -> Result<(), CacheError> {
        for store in self.stores.iter().flatten() {
            store.read().await.close()?;
        }
        Ok(())
    }

    /// Reserve space for a new item in the slowest configured tier.
    ///
    /// The caller fills the reservation (header bytes, then body bytes) and
    /// then calls [`commit`](Self::commit); on a short or failed fill it
    /// must roll back with [`delete`](Self::delete) on the key.
    pub async fn add(
        &self,
        key: Key,
        group: Option<Key>,
        raw_key: Bytes,
        head_len: u64,
        body_len: u64,
    ) -> Result<WriteReservation, CacheError> {
        let store = self.slowest().ok_or(CacheError::NoTiersConfigured)?;
        store
            .write()
            .await
            .add(key, group, raw_key, head_len, body_len)
    }

    /// Mark a reservation's payload copy complete.
    pub async fn commit(&self, reservation: &WriteReservation) {
        if let Some(store) = self.slowest() {
            store.write().await.commit(reservation);
        }
    }

    /// Look up a key, scanning tiers fastest to slowest. On a hit in a
    /// non-fastest tier the item is copied into every faster configured
    /// tier; the returned data comes from the tier where it was found.
    pub async fn get(&self, key: &Key) -> Option<CacheHit> {
        for (i, tier) in Tier::ALL.iter().enumerate() {
            let Some(store) = &self.stores[i] else {
                continue;
            };
            let Some((record, data)) = store.read().await.get(key) else {
                continue;
            };

            for (j, faster) in self.stores[..i].iter().enumerate() {
                let Some(faster) = faster else { continue };
                match Self::promote(faster, store, &record, &data).await {
                    // Promotion is best-effort; the hit still stands.
                    Err(e) => warn!(
                        tier = %Tier::ALL[j],
                        key = %record.id,
                        error = %e,
                        "promotion failed"
                    ),
                    Ok(false) => debug!(
                        tier = %Tier::ALL[j],
                        key = %record.id,
                        "source record gone during promotion, copy discarded"
                    ),
                    Ok(true) => {
                        debug!(tier = %Tier::ALL[j], key = %record.id, from = %tier, "promoted item");
                    }
                }
            }

            return Some(CacheHit {
                record,
                data,
                tier: *tier,
            });
        }
        None
    }

    /// Copy one item into a faster store: allocate, copy bytes, commit.
    /// The byte copy runs without holding either store lock.
    ///
    /// Before committing, the source record is re-checked: a delete that
    /// raced the copy has already swept the destination tier, and
    /// publishing the copy afterwards would resurrect the key. Returns
    /// whether the copy was published.
    async fn promote(
        dest: &RwLock<Store>,
        source: &RwLock<Store>,
        record: &ItemRecord,
        data: &ItemHandle,
    ) -> Result<bool, CacheError> {
        let mut reservation = dest.write().await.add(
            record.id,
            record.group,
            record.raw_key.clone(),
            record.head_len,
            record.body_len,
        )?;
        reservation.buf().copy_from_slice(&data[..]);

        let still_live = source
            .read()
            .await
            .get(&record.id)
            .is_some_and(|(r, _)| r.block_id == record.block_id && r.offset == record.offset);
        if still_live {
            dest.write().await.commit(&reservation);
        } else {
            dest.write().await.abort(&reservation);
        }
        Ok(still_live)
    }

    /// Delete a key from every configured tier. Idempotent; returns whether
    /// any tier held a record.
    ///
    /// A concurrent `get` may still publish a promoted copy in the narrow
    /// window between its source re-check and its commit; such a copy is
    /// byte-identical to the deleted item and falls out with its block.
    pub async fn delete(&self, key: &Key) -> bool {
        let mut removed = false;
        for store in self.stores.iter().flatten() {
            removed |= store.write().await.delete(key);
        }
        removed
    }

    /// Delete every record matching the predicate in every configured tier,
    /// returning the aggregate count.
    pub async fn delete_batch(&self, matches: impl Fn(&ItemRecord) -> bool) -> usize {
        let mut removed = 0;
        for store in self.stores.iter().flatten() {
            removed += store.write().await.delete_batch(&matches);
        }
        removed
    }

    /// Delete every item belonging to `group`.
    pub async fn delete_group(&self, group: Key) -> usize {
        self.delete_batch(|record| record.group == Some(group)).await
    }

    /// Delete every item whose raw key matches `pattern`.
    pub async fn delete_raw_key(&self, pattern: &regex::bytes::Regex) -> usize {
        self.delete_batch(|record| pattern.is_match(&record.raw_key))
            .await
    }

    /// Per-tier usage for monitoring.
    pub async fn stats(&self) -> Vec<(Tier, StoreStats)> {
        let mut out = Vec::new();
        for (i, tier) in Tier::ALL.iter().enumerate() {
            if let Some(store) = &self.stores[i] {
                out.push((*tier, store.read().await.stats()));
            }
        }
        out
    }

    /// The slowest configured store: where all writes land.
    fn slowest(&self) -> Option<&RwLock<Store>> {
        self.stores.iter().rev().flatten().next()
    }
}
