//! Single-use result cache shared by paired query kinds.
//!
//! One upstream call answers both halves of a pair. The half that performed
//! the call leaves its response here; the complementary half consumes it.
//! Each key holds at most one entry, entries are never updated in place, and
//! every read clears the slot.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::challenges::core::{LookupKey, QueryKind, RawResponse};

/// What [`PairedResultCache::store`] did with the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Slot was empty; the response now waits for the complementary kind.
    Stored,
    /// A response from the complementary kind was already waiting, so both
    /// halves are answered and that entry was dropped.
    Settled,
    /// A response from the same kind was already waiting; nothing changed.
    Occupied,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    producer: QueryKind,
    response: RawResponse,
}

/// Concurrency-safe write-once-read-once store keyed by lookup key.
#[derive(Debug, Clone, Default)]
pub struct PairedResultCache {
    entries: Arc<Mutex<HashMap<LookupKey, CacheEntry>>>,
}

impl PairedResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<LookupKey, CacheEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Atomically take the entry for `key` if it was produced by the partner
    /// of `kind`. A repeated request for the same kind never consumes its own
    /// entry.
    pub fn try_consume(&self, key: &LookupKey, kind: QueryKind) -> Option<RawResponse> {
        let mut entries = self.lock();
        let consumable = entries
            .get(key)
            .is_some_and(|entry| Some(entry.producer) == kind.partner());
        if consumable {
            entries.remove(key).map(|entry| entry.response)
        } else {
            None
        }
    }

    /// Record the response `kind` fetched for `key`. Never overwrites.
    pub fn store(&self, key: &LookupKey, kind: QueryKind, response: RawResponse) -> StoreOutcome {
        let mut entries = self.lock();
        match entries.entry(key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(CacheEntry {
                    producer: kind,
                    response,
                });
                StoreOutcome::Stored
            }
            Entry::Occupied(slot) if Some(slot.get().producer) == kind.partner() => {
                slot.remove();
                StoreOutcome::Settled
            }
            Entry::Occupied(_) => StoreOutcome::Occupied,
        }
    }

    pub fn contains(&self, key: &LookupKey) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key() -> LookupKey {
        LookupKey::parse("X9FKXXEEBKBM40204").unwrap()
    }

    fn response() -> RawResponse {
        RawResponse::from_value(json!({"status": 200, "RequestResult": {"vin": "X9FKXXEEBKBM40204"}}))
    }

    #[test]
    fn partner_consumes_once() {
        let cache = PairedResultCache::new();
        assert_eq!(
            cache.store(&key(), QueryKind::GeneralInfo, response()),
            StoreOutcome::Stored
        );

        assert!(cache.try_consume(&key(), QueryKind::GeneralInfo).is_none());
        assert_eq!(
            cache.try_consume(&key(), QueryKind::RegistrationHistory),
            Some(response())
        );
        assert!(cache.try_consume(&key(), QueryKind::RegistrationHistory).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn never_overwrites() {
        let cache = PairedResultCache::new();
        cache.store(&key(), QueryKind::GeneralInfo, response());
        let other = RawResponse::from_value(json!({"status": 200, "other": true}));
        assert_eq!(
            cache.store(&key(), QueryKind::GeneralInfo, other),
            StoreOutcome::Occupied
        );
        assert_eq!(
            cache.try_consume(&key(), QueryKind::RegistrationHistory),
            Some(response())
        );
    }

    #[test]
    fn partner_store_settles_the_pair() {
        let cache = PairedResultCache::new();
        cache.store(&key(), QueryKind::RegistrationHistory, response());
        assert_eq!(
            cache.store(&key(), QueryKind::GeneralInfo, response()),
            StoreOutcome::Settled
        );
        assert!(!cache.contains(&key()));
    }

    #[test]
    fn concurrent_consumers_see_one_hit() {
        let cache = PairedResultCache::new();
        cache.store(&key(), QueryKind::GeneralInfo, response());

        let hits: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let cache = cache.clone();
                    scope.spawn(move || {
                        cache
                            .try_consume(&key(), QueryKind::RegistrationHistory)
                            .is_some() as usize
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(hits, 1);
    }
}
