//! Listing cache
//!
//! Directory listings are cached per (server, path, user) for a bounded time.
//! Each slot is one JSON record named by its fingerprint. The record also
//! carries the raw key components so a per-user clear matches exactly
//! instead of guessing from the digest.
//!
//! Stale records are only removed when a read finds them; there is no sweep.
//! Store failures are never surfaced: they are logged and read as a miss.

use crate::api::Listing;
use crate::store::JsonStore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const CACHE_DIR: &str = "cache";
/// Keeps the chrono duration in range; about 290 million years.
const MAX_AGE_CAP_SECS: u64 = (i64::MAX / 1000) as u64;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheRecord {
    server: String,
    path: String,
    user_id: String,
    fetched_at: DateTime<Utc>,
    listing: Listing,
}

#[derive(Debug, Clone)]
pub struct ResponseCache {
    store: JsonStore,
}

impl ResponseCache {
    pub fn new(store: JsonStore) -> Self {
        Self { store }
    }

    /// Deterministic slot key: SHA-256 over the NUL-separated components.
    pub fn fingerprint(server: &str, path: &str, user_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(server.as_bytes());
        hasher.update([0u8]);
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(user_id.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn get(&self, server: &str, path: &str, user_id: &str, max_age_secs: u64) -> Option<Listing> {
        self.get_at(server, path, user_id, max_age_secs, Utc::now())
    }

    pub(crate) fn get_at(
        &self,
        server: &str,
        path: &str,
        user_id: &str,
        max_age_secs: u64,
        now: DateTime<Utc>,
    ) -> Option<Listing> {
        let key = Self::fingerprint(server, path, user_id);
        let record = match self.store.read::<CacheRecord>(CACHE_DIR, &key) {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                tracing::debug!("cache read failed for {}: {:#}", path, e);
                return None;
            }
        };

        let max_age = Duration::seconds(max_age_secs.min(MAX_AGE_CAP_SECS) as i64);
        if now.signed_duration_since(record.fetched_at) > max_age {
            if let Err(e) = self.store.remove(CACHE_DIR, &key) {
                tracing::debug!("cache evict failed for {}: {:#}", path, e);
            }
            return None;
        }

        Some(record.listing)
    }

    pub fn set(&self, server: &str, path: &str, user_id: &str, listing: &Listing) {
        self.set_at(server, path, user_id, listing, Utc::now())
    }

    pub(crate) fn set_at(
        &self,
        server: &str,
        path: &str,
        user_id: &str,
        listing: &Listing,
        fetched_at: DateTime<Utc>,
    ) {
        let key = Self::fingerprint(server, path, user_id);
        let record = CacheRecord {
            server: server.to_string(),
            path: path.to_string(),
            user_id: user_id.to_string(),
            fetched_at,
            listing: listing.clone(),
        };
        if let Err(e) = self.store.write(CACHE_DIR, &key, &record) {
            tracing::debug!("cache write failed for {}: {:#}", path, e);
        }
    }

    /// Forget one slot, e.g. after the directory changed remotely.
    pub fn invalidate(&self, server: &str, path: &str, user_id: &str) {
        let key = Self::fingerprint(server, path, user_id);
        if let Err(e) = self.store.remove(CACHE_DIR, &key) {
            tracing::debug!("cache invalidate failed for {}: {:#}", path, e);
        }
    }

    /// Drop every record for `user_id`, or everything when `None`.
    /// Returns how many records were removed.
    pub fn clear(&self, user_id: Option<&str>) -> usize {
        let keys = match self.store.keys(CACHE_DIR) {
            Ok(keys) => keys,
            Err(e) => {
                tracing::debug!("cache listing failed: {:#}", e);
                return 0;
            }
        };

        let mut removed = 0;
        for key in keys {
            if let Some(user_id) = user_id {
                // Unreadable records cannot be attributed to anyone; leave them
                // for the read path to replace.
                match self.store.read::<CacheRecord>(CACHE_DIR, &key) {
                    Ok(Some(record)) if record.user_id == user_id => {}
                    _ => continue,
                }
            }
            match self.store.remove(CACHE_DIR, &key) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => tracing::debug!("cache remove failed for {}: {:#}", key, e),
            }
        }
        removed
    }
}
