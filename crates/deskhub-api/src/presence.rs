//! Write-behind presence cache.
//!
//! Heartbeats land in memory through [`PresenceCache::touch`]; the flush
//! scheduler later calls [`PresenceCache::drain`] to push them to the
//! [`PeerStore`]. A heartbeat for an identity that is not yet cached seeds the
//! entry from the store, and unknown peers are dropped without creating state.
//!
//! Every mutation takes a version from one cache-wide counter. `drain` removes
//! an entry before writing it back and, when the write fails, puts it back only
//! if nothing strictly newer has been cached for that identity in the
//! meantime. A record drained and later reloaded from the store therefore
//! always outranks the copy an in-flight writeback is holding.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, warn};

use crate::models::PeerRecord;
use crate::store::{PeerStore, StoreError};

/// Outcome of one drain cycle
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries written to the store and released from the cache
    pub persisted: usize,
    /// Entries whose write failed and were re-queued
    pub retried: usize,
    /// Failed entries dropped because a newer heartbeat was already cached
    pub superseded: usize,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.persisted == 0 && self.retried == 0 && self.superseded == 0
    }
}

pub struct PresenceCache {
    entries: DashMap<String, PeerRecord>,
    store: Arc<dyn PeerStore>,
    next_version: AtomicU64,
}

impl PresenceCache {
    pub fn new(store: Arc<dyn PeerStore>) -> Self {
        Self {
            entries: DashMap::new(),
            store,
            next_version: AtomicU64::new(0),
        }
    }

    fn apply(&self, peer: &mut PeerRecord, ip: &str, now: u64) {
        peer.last_online_time = now;
        peer.last_online_ip = ip.to_string();
        peer.version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
    }

    /// Record a heartbeat from `uuid` seen at `ip`.
    ///
    /// Returns whether the heartbeat was kept. Nothing here is an error: an
    /// empty identity, an unknown peer and an unreachable store all just drop
    /// the heartbeat.
    pub async fn touch(&self, uuid: &str, ip: &str, now: u64) -> bool {
        if uuid.is_empty() {
            return false;
        }

        if let Some(mut peer) = self.entries.get_mut(uuid) {
            self.apply(&mut peer, ip, now);
            return true;
        }

        // Shard guards are never held across the store lookup.
        let loaded = match self.store.find_by_uuid(uuid).await {
            Ok(Some(peer)) => peer,
            Ok(None) => {
                debug!("Heartbeat from unregistered peer {} dropped", uuid);
                return false;
            }
            Err(e) => {
                debug!("Heartbeat from {} dropped, store lookup failed: {}", uuid, e);
                return false;
            }
        };

        match self.entries.entry(uuid.to_string()) {
            Entry::Occupied(mut cached) => self.apply(cached.get_mut(), ip, now),
            Entry::Vacant(slot) => {
                let mut peer = loaded;
                self.apply(&mut peer, ip, now);
                slot.insert(peer);
            }
        }
        true
    }

    /// Hand every cached record to `writeback`, one at a time.
    ///
    /// Callers must not run two drains at once; [`crate::flush::FlushScheduler`]
    /// serializes them. Heartbeats may keep arriving while a drain is running.
    pub async fn drain<F, Fut>(&self, mut writeback: F) -> DrainReport
    where
        F: FnMut(PeerRecord) -> Fut,
        Fut: Future<Output = Result<(), StoreError>>,
    {
        let mut report = DrainReport::default();
        let snapshot: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();

        for uuid in snapshot {
            let Some((_, peer)) = self.entries.remove(&uuid) else {
                continue;
            };
            let version = peer.version;

            match writeback(peer.clone()).await {
                Ok(()) => report.persisted += 1,
                Err(e) => {
                    warn!(uuid = %uuid, error = %e, "Failed to persist presence, will retry");
                    match self.entries.entry(uuid) {
                        Entry::Occupied(cached) if cached.get().version > version => {
                            report.superseded += 1;
                        }
                        Entry::Occupied(mut cached) => {
                            cached.insert(peer);
                            report.retried += 1;
                        }
                        Entry::Vacant(slot) => {
                            slot.insert(peer);
                            report.retried += 1;
                        }
                    }
                }
            }
        }

        report
    }

    /// Drain into the backing store
    pub async fn flush(&self) -> DrainReport {
        let store = Arc::clone(&self.store);
        self.drain(move |peer| {
            let store = Arc::clone(&store);
            async move { store.save(&peer).await }
        })
        .await
    }

    /// Cached copy of a peer, if it has unflushed presence
    pub fn get(&self, uuid: &str) -> Option<PeerRecord> {
        self.entries.get(uuid).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use proptest::prelude::*;

    fn cache_with(uuids: &[&str]) -> (Arc<MemoryStore>, PresenceCache) {
        let store = Arc::new(MemoryStore::with_peers(uuids));
        let cache = PresenceCache::new(store.clone());
        (store, cache)
    }

    #[tokio::test]
    async fn test_touch_then_flush_persists() {
        let (store, cache) = cache_with(&["p1"]);

        assert!(cache.touch("p1", "10.0.0.1", 100).await);
        let report = cache.flush().await;

        assert_eq!(report.persisted, 1);
        assert!(cache.is_empty());
        let saved = store.get("p1").unwrap();
        assert_eq!(saved.last_online_time, 100);
        assert_eq!(saved.last_online_ip, "10.0.0.1");
    }

    #[tokio::test]
    async fn test_later_touch_wins_with_single_write() {
        let (store, cache) = cache_with(&["p1"]);

        cache.touch("p1", "10.0.0.1", 100).await;
        cache.touch("p1", "10.0.0.2", 105).await;
        assert_eq!(cache.len(), 1);

        let report = cache.flush().await;
        assert_eq!(report.persisted, 1);
        assert_eq!(store.save_count(), 1);
        let saved = store.get("p1").unwrap();
        assert_eq!(saved.last_online_time, 105);
        assert_eq!(saved.last_online_ip, "10.0.0.2");
    }

    #[tokio::test]
    async fn test_cached_touch_skips_store_lookup() {
        let (store, cache) = cache_with(&["p1"]);
        cache.touch("p1", "10.0.0.1", 100).await;

        // The entry is resident, so an unreachable store must not matter.
        store.set_fail_finds(true);
        assert!(cache.touch("p1", "10.0.0.2", 101).await);
        assert_eq!(cache.get("p1").unwrap().last_online_time, 101);
    }

    #[tokio::test]
    async fn test_unknown_and_empty_identities_are_dropped() {
        let (store, cache) = cache_with(&["p1"]);

        assert!(!cache.touch("", "10.0.0.1", 100).await);
        assert!(!cache.touch("stranger", "10.0.0.1", 100).await);
        assert!(cache.is_empty());

        let report = cache.flush().await;
        assert!(report.is_empty());
        assert!(store.get("stranger").is_none());
    }

    #[tokio::test]
    async fn test_store_failure_on_lookup_drops_heartbeat() {
        let (store, cache) = cache_with(&["p1"]);
        store.set_fail_finds(true);

        assert!(!cache.touch("p1", "10.0.0.1", 100).await);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_is_retried_next_cycle() {
        let (store, cache) = cache_with(&["p1", "p2"]);
        cache.touch("p1", "10.0.0.1", 100).await;
        cache.touch("p2", "10.0.0.2", 100).await;

        store.set_fail_saves(true);
        let report = cache.flush().await;
        assert_eq!(report, DrainReport { persisted: 0, retried: 2, superseded: 0 });
        assert_eq!(cache.len(), 2);
        assert_eq!(store.get("p1").unwrap().last_online_time, 0);

        store.set_fail_saves(false);
        let report = cache.flush().await;
        assert_eq!(report.persisted, 2);
        assert!(cache.is_empty());
        assert_eq!(store.get("p1").unwrap().last_online_time, 100);
        assert_eq!(store.get("p2").unwrap().last_online_ip, "10.0.0.2");
    }

    #[tokio::test]
    async fn test_failed_write_does_not_clobber_newer_touch() {
        let (store, cache) = cache_with(&["p1"]);
        cache.touch("p1", "10.0.0.1", 100).await;

        let report = cache
            .drain(|_peer| {
                let cache = &cache;
                async move {
                    cache.touch("p1", "10.0.0.3", 110).await;
                    Err(StoreError::Unavailable("down".to_string()))
                }
            })
            .await;
        assert_eq!(report, DrainReport { persisted: 0, retried: 0, superseded: 1 });

        let cached = cache.get("p1").unwrap();
        assert_eq!(cached.last_online_time, 110);
        assert_eq!(cached.last_online_ip, "10.0.0.3");

        cache.flush().await;
        assert_eq!(store.get("p1").unwrap().last_online_time, 110);
    }

    #[tokio::test]
    async fn test_touch_during_successful_write_is_kept_for_next_drain() {
        let (store, cache) = cache_with(&["p1"]);
        cache.touch("p1", "10.0.0.1", 100).await;

        let store_for_writeback = store.clone();
        let report = cache
            .drain(|peer| {
                let cache = &cache;
                let store = store_for_writeback.clone();
                async move {
                    cache.touch("p1", "10.0.0.4", 120).await;
                    store.save(&peer).await
                }
            })
            .await;
        assert_eq!(report.persisted, 1);
        assert_eq!(store.get("p1").unwrap().last_online_time, 100);
        assert_eq!(cache.get("p1").unwrap().last_online_time, 120);

        cache.flush().await;
        let saved = store.get("p1").unwrap();
        assert_eq!(saved.last_online_time, 120);
        assert_eq!(saved.last_online_ip, "10.0.0.4");
    }

    #[tokio::test]
    async fn test_reloaded_record_outranks_drained_copy() {
        let (_store, cache) = cache_with(&["p1"]);
        cache.touch("p1", "10.0.0.1", 100).await;
        cache.touch("p1", "10.0.0.1", 101).await;
        let drained_version = cache.get("p1").unwrap().version;

        cache.flush().await;
        cache.touch("p1", "10.0.0.1", 102).await;
        assert!(cache.get("p1").unwrap().version > drained_version);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_touches_and_drains_lose_nothing() {
        let uuids: Vec<String> = (0..16).map(|i| format!("peer-{i}")).collect();
        let refs: Vec<&str> = uuids.iter().map(String::as_str).collect();
        let store = Arc::new(MemoryStore::with_peers(&refs));
        let cache = Arc::new(PresenceCache::new(store.clone()));

        let mut workers = Vec::new();
        for uuid in uuids.clone() {
            let cache = cache.clone();
            workers.push(tokio::spawn(async move {
                for t in 1..=50u64 {
                    cache.touch(&uuid, "10.1.1.1", t).await;
                    tokio::task::yield_now().await;
                }
            }));
        }

        let drainer = {
            let cache = cache.clone();
            tokio::spawn(async move {
                for _ in 0..20 {
                    cache.flush().await;
                    tokio::task::yield_now().await;
                }
            })
        };

        for w in workers {
            w.await.unwrap();
        }
        drainer.await.unwrap();
        cache.flush().await;

        assert!(cache.is_empty());
        for uuid in &uuids {
            assert_eq!(store.get(uuid).unwrap().last_online_time, 50, "stale presence for {uuid}");
        }
    }

    proptest! {
        // Whatever mix of failed and successful drains happens between heartbeats,
        // once the store is healthy the last heartbeat is what ends up persisted.
        #[test]
        fn test_last_touch_is_persisted(
            steps in prop::collection::vec((any::<bool>(), any::<bool>()), 1..40)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let (store, cache) = cache_with(&["p1"]);
                let mut last = None;

                for (i, (drain_after, fail)) in steps.iter().enumerate() {
                    let t = 100 + i as u64;
                    let ip = format!("10.0.0.{}", i % 250);
                    cache.touch("p1", &ip, t).await;
                    last = Some((t, ip));
                    if *drain_after {
                        store.set_fail_saves(*fail);
                        cache.flush().await;
                    }
                }

                store.set_fail_saves(false);
                cache.flush().await;
                prop_assert!(cache.is_empty());

                let (t, ip) = last.unwrap();
                let saved = store.get("p1").unwrap();
                prop_assert_eq!(saved.last_online_time, t);
                prop_assert_eq!(saved.last_online_ip, ip);
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}
