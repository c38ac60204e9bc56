use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    linked_map::LinkedMap,
    observable::{Observable, Subscription},
    settings::Settings,
    types::Segment,
};

type PinPredicate = Arc<dyn Fn(&Segment) -> bool + Send + Sync>;

/// Handle for removing a pin predicate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PinId(u64);

/// Emitted after the cache contents change, naming every stream that gained
/// or lost segments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheChange {
    pub streams: Vec<String>,
}

impl CacheChange {
    pub fn touches(&self, stream_id: &str) -> bool {
        self.streams.iter().any(|s| s == stream_id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CacheKey {
    stream_id: String,
    external_id: String,
}

impl CacheKey {
    fn new(stream_id: &str, external_id: &str) -> CacheKey {
        CacheKey {
            stream_id: stream_id.to_owned(),
            external_id: external_id.to_owned(),
        }
    }
}

struct CacheEntry {
    segment: Arc<Segment>,
    data: Bytes,
    last_accessed: Instant,
    /// Bumped on every store and read, so cleanup can tell whether an entry
    /// was used after it was judged.
    access_seq: u64,
}

#[derive(Default)]
struct Inner {
    /// Least recently accessed first.
    entries: LinkedMap<CacheKey, CacheEntry>,
    next_access_seq: u64,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.next_access_seq += 1;
        self.next_access_seq
    }

    /// Remove the given entries unless they were accessed since `seq` was
    /// observed. Returns the affected stream ids.
    fn remove_unless_touched(&mut self, victims: Vec<(CacheKey, u64)>) -> BTreeSet<String> {
        let mut streams = BTreeSet::new();
        for (key, seq) in victims {
            if self.entries.get(&key).map(|e| e.access_seq) == Some(seq) {
                self.entries.remove(&key);
                trace!(stream = %key.stream_id, segment = %key.external_id, "evicted");
                streams.insert(key.stream_id);
            }
        }
        streams
    }

    /// Remove entries in `evictable` in least recently used order until at
    /// most `max` remain. Recency is read under the lock, so an entry used
    /// since the pins were evaluated moves behind older ones.
    fn evict_over(&mut self, max: usize, evictable: &HashSet<CacheKey>) -> BTreeSet<String> {
        let excess = self.entries.len().saturating_sub(max);
        let victims: Vec<CacheKey> = self
            .entries
            .keys()
            .filter(|k| evictable.contains(*k))
            .take(excess)
            .cloned()
            .collect();
        let mut streams = BTreeSet::new();
        for key in victims {
            self.entries.remove(&key);
            trace!(stream = %key.stream_id, segment = %key.external_id, "evicted");
            streams.insert(key.stream_id);
        }
        streams
    }
}

struct Snapshot {
    key: CacheKey,
    segment: Arc<Segment>,
    last_accessed: Instant,
    access_seq: u64,
}

/// In-memory segment store shared by every swarm.
///
/// Entries are bounded by age and count; [`SegmentCache::cleanup`] enforces
/// both, never evicting a segment that any registered pin predicate claims.
#[derive(Clone)]
pub struct SegmentCache {
    inner: Arc<Mutex<Inner>>,
    pins: Arc<Mutex<HashMap<PinId, PinPredicate>>>,
    next_pin: Arc<Mutex<u64>>,
    changes: Observable<CacheChange>,
    expiration: Duration,
    max_entries: usize,
    cleanup_interval: Duration,
}

impl SegmentCache {
    pub fn new(settings: &Settings) -> SegmentCache {
        SegmentCache {
            inner: Arc::new(Mutex::new(Inner::default())),
            pins: Arc::new(Mutex::new(HashMap::new())),
            next_pin: Arc::new(Mutex::new(0)),
            changes: Observable::new(),
            expiration: settings.cached_segment_expiration,
            max_entries: settings.cached_segments_count,
            cleanup_interval: settings.storage_cleanup_interval,
        }
    }

    /// Insert or replace a segment's data, making it the most recently used.
    pub fn store(&self, segment: Arc<Segment>, data: Bytes) {
        let stream_id = segment.stream_id.clone();
        {
            let mut inner = self.inner.lock();
            let access_seq = inner.next_seq();
            let key = CacheKey::new(&segment.stream_id, &segment.external_id);
            trace!(stream = %key.stream_id, segment = %key.external_id, len = data.len(), "store");
            inner.entries.push_back(
                key,
                CacheEntry {
                    segment,
                    data,
                    last_accessed: Instant::now(),
                    access_seq,
                },
            );
        }
        self.changes.notify(&CacheChange {
            streams: vec![stream_id],
        });
    }

    /// Segment data, if cached. Counts as an access.
    pub fn get(&self, stream_id: &str, external_id: &str) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        let access_seq = inner.next_seq();
        let key = CacheKey::new(stream_id, external_id);
        let entry = inner.entries.get_mut(&key)?;
        entry.last_accessed = Instant::now();
        entry.access_seq = access_seq;
        let data = entry.data.clone();
        inner.entries.move_to_back(&key);
        Some(data)
    }

    pub fn has(&self, stream_id: &str, external_id: &str) -> bool {
        self.inner
            .lock()
            .entries
            .contains_key(&CacheKey::new(stream_id, external_id))
    }

    /// External ids of a stream's cached segments, least recently used first.
    pub fn stored_external_ids(&self, stream_id: &str) -> Vec<String> {
        self.inner
            .lock()
            .entries
            .keys()
            .filter(|k| k.stream_id == stream_id)
            .map(|k| k.external_id.clone())
            .collect()
    }

    pub fn has_stream(&self, stream_id: &str) -> bool {
        self.inner
            .lock()
            .entries
            .keys()
            .any(|k| k.stream_id == stream_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Protect segments matching `predicate` from eviction until the pin is
    /// removed.
    pub fn register_pin<F>(&self, predicate: F) -> PinId
    where
        F: Fn(&Segment) -> bool + Send + Sync + 'static,
    {
        let id = {
            let mut next = self.next_pin.lock();
            *next += 1;
            PinId(*next)
        };
        self.pins.lock().insert(id, Arc::new(predicate));
        id
    }

    pub fn unregister_pin(&self, id: PinId) -> bool {
        self.pins.lock().remove(&id).is_some()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&CacheChange) + Send + Sync + 'static,
    {
        self.changes.subscribe(callback)
    }

    /// Drop every entry belonging to a stream.
    pub fn remove_stream(&self, stream_id: &str) -> usize {
        let removed = {
            let mut inner = self.inner.lock();
            let keys: Vec<CacheKey> = inner
                .entries
                .keys()
                .filter(|k| k.stream_id == stream_id)
                .cloned()
                .collect();
            for key in keys.iter() {
                inner.entries.remove(key);
            }
            keys.len()
        };
        if removed > 0 {
            debug!(stream = stream_id, removed, "removed stream from cache");
            self.changes.notify(&CacheChange {
                streams: vec![stream_id.to_owned()],
            });
        }
        removed
    }

    /// Drop every entry. Subscribers are told about each affected stream.
    pub fn clear(&self) {
        let streams: BTreeSet<String> = {
            let mut inner = self.inner.lock();
            let streams = inner.entries.keys().map(|k| k.stream_id.clone()).collect();
            inner.entries.clear();
            streams
        };
        if !streams.is_empty() {
            self.changes.notify(&CacheChange {
                streams: streams.into_iter().collect(),
            });
        }
    }

    /// Enforce the age and count bounds. Subscribers get at most one
    /// notification per call. Returns whether anything was removed.
    pub fn cleanup(&self) -> bool {
        let now = Instant::now();
        let pins: Vec<PinPredicate> = self.pins.lock().values().cloned().collect();
        let is_pinned = |segment: &Segment| pins.iter().any(|p| p(segment));

        // Expired entries. Pin predicates run without the cache lock held.
        let victims: Vec<(CacheKey, u64)> = self
            .snapshot()
            .into_iter()
            .filter(|s| now.saturating_duration_since(s.last_accessed) > self.expiration)
            .filter(|s| !is_pinned(&s.segment))
            .map(|s| (s.key, s.access_seq))
            .collect();
        let mut removed = if victims.is_empty() {
            BTreeSet::new()
        } else {
            self.inner.lock().remove_unless_touched(victims)
        };
        if !removed.is_empty() {
            debug!(streams = ?removed, "expired cached segments");
        }

        // Over the count bound, least recently accessed first.
        let snapshot = self.snapshot();
        if snapshot.len() > self.max_entries {
            let evictable: HashSet<CacheKey> = snapshot
                .into_iter()
                .filter(|s| !is_pinned(&s.segment))
                .map(|s| s.key)
                .collect();
            let evicted = self
                .inner
                .lock()
                .evict_over(self.max_entries, &evictable);
            if !evicted.is_empty() {
                debug!(streams = ?evicted, "evicted cached segments over capacity");
            }
            removed.extend(evicted);
        }

        if removed.is_empty() {
            return false;
        }
        self.changes.notify(&CacheChange {
            streams: removed.into_iter().collect(),
        });
        true
    }

    /// Run [`SegmentCache::cleanup`] on the configured interval until
    /// cancelled.
    pub fn spawn_cleanup(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        let period = self.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        cache.cleanup();
                    }
                }
            }
        })
    }

    fn snapshot(&self) -> Vec<Snapshot> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(key, entry)| Snapshot {
                key: key.clone(),
                segment: entry.segment.clone(),
                last_accessed: entry.last_accessed,
                access_seq: entry.access_seq,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use tokio::time::advance;

    use super::*;

    fn settings(count: usize, expiration_secs: u64) -> Settings {
        Settings {
            cached_segments_count: count,
            cached_segment_expiration: Duration::from_secs(expiration_secs),
            ..Settings::default()
        }
    }

    fn segment(stream: &str, id: &str) -> Arc<Segment> {
        Arc::new(Segment::new(id, id, stream))
    }

    fn record_changes(cache: &SegmentCache) -> (Arc<StdMutex<Vec<CacheChange>>>, Subscription) {
        let seen = Arc::new(StdMutex::new(vec![]));
        let seen_cb = seen.clone();
        let sub = cache.subscribe(move |c| seen_cb.lock().unwrap().push(c.clone()));
        (seen, sub)
    }

    #[tokio::test(start_paused = true)]
    async fn test_count_bound_evicts_least_recent() {
        let cache = SegmentCache::new(&settings(2, 120));
        cache.store(segment("v", "A"), Bytes::from_static(b"a"));
        cache.store(segment("v", "B"), Bytes::from_static(b"b"));
        cache.store(segment("v", "C"), Bytes::from_static(b"c"));
        let (seen, _sub) = record_changes(&cache);

        assert!(cache.cleanup());
        assert!(!cache.has("v", "A"));
        assert_eq!(cache.stored_external_ids("v"), vec!["B", "C"]);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![CacheChange {
                streams: vec!["v".to_owned()]
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_refreshes_recency() {
        let cache = SegmentCache::new(&settings(2, 120));
        cache.store(segment("v", "A"), Bytes::from_static(b"a"));
        cache.store(segment("v", "B"), Bytes::from_static(b"b"));
        assert_eq!(cache.get("v", "A"), Some(Bytes::from_static(b"a")));
        cache.store(segment("v", "C"), Bytes::from_static(b"c"));

        cache.cleanup();
        assert!(cache.has("v", "A"));
        assert!(!cache.has("v", "B"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_removed() {
        let cache = SegmentCache::new(&settings(50, 10));
        cache.store(segment("v", "old"), Bytes::from_static(b"o"));
        advance(Duration::from_secs(6)).await;
        cache.store(segment("v", "new"), Bytes::from_static(b"n"));
        advance(Duration::from_secs(5)).await;

        assert!(cache.cleanup());
        assert_eq!(cache.stored_external_ids("v"), vec!["new"]);
        assert!(!cache.cleanup());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pinned_entries_survive() {
        let cache = SegmentCache::new(&settings(1, 10));
        cache.store(segment("v", "A"), Bytes::from_static(b"a"));
        cache.store(segment("v", "B"), Bytes::from_static(b"b"));
        cache.store(segment("v", "C"), Bytes::from_static(b"c"));
        let pin = cache.register_pin(|s| s.external_id == "A" || s.external_id == "B");

        advance(Duration::from_secs(11)).await;
        cache.cleanup();
        // Expiry takes C; A and B stay pinned even though they exceed the bound.
        assert_eq!(cache.stored_external_ids("v"), vec!["A", "B"]);

        assert!(cache.unregister_pin(pin));
        cache.cleanup();
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_during_cleanup_still_honors_bound() {
        let cache = SegmentCache::new(&settings(1, 120));
        cache.store(segment("v", "A"), Bytes::from_static(b"a"));
        cache.store(segment("v", "B"), Bytes::from_static(b"b"));

        // Reading A while pins are evaluated makes B the least recent.
        let reader = cache.clone();
        cache.register_pin(move |s| {
            if s.external_id == "A" {
                reader.get("v", "A");
            }
            false
        });
        assert!(cache.cleanup());
        assert_eq!(cache.stored_external_ids("v"), vec!["A"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_during_cleanup_keeps_entry_from_expiring() {
        let cache = SegmentCache::new(&settings(50, 10));
        cache.store(segment("v", "A"), Bytes::from_static(b"a"));
        advance(Duration::from_secs(11)).await;

        let reader = cache.clone();
        cache.register_pin(move |s| {
            reader.get(&s.stream_id, &s.external_id);
            false
        });
        assert!(!cache.cleanup());
        assert!(cache.has("v", "A"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_notification_per_cleanup() {
        let cache = SegmentCache::new(&settings(1, 10));
        cache.store(segment("v", "A"), Bytes::from_static(b"a"));
        cache.store(segment("a", "A"), Bytes::from_static(b"a"));
        advance(Duration::from_secs(11)).await;
        cache.store(segment("v", "B"), Bytes::from_static(b"b"));
        cache.store(segment("v", "C"), Bytes::from_static(b"c"));
        let (seen, _sub) = record_changes(&cache);

        assert!(cache.cleanup());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![CacheChange {
                streams: vec!["a".to_owned(), "v".to_owned()]
            }]
        );
        assert_eq!(cache.stored_external_ids("v"), vec!["C"]);
        assert!(!cache.has_stream("a"));
    }

    #[tokio::test]
    async fn test_streams_are_separate() {
        let cache = SegmentCache::new(&Settings::default());
        cache.store(segment("v", "1"), Bytes::from_static(b"v1"));
        cache.store(segment("a", "1"), Bytes::from_static(b"a1"));
        assert_eq!(cache.get("v", "1"), Some(Bytes::from_static(b"v1")));
        assert_eq!(cache.get("a", "1"), Some(Bytes::from_static(b"a1")));
        assert!(cache.has_stream("a"));

        assert_eq!(cache.remove_stream("a"), 1);
        assert!(!cache.has_stream("a"));
        assert!(cache.has("v", "1"));
        assert_eq!(cache.get("a", "1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_runs_on_interval() {
        let cache = SegmentCache::new(&Settings {
            cached_segment_expiration: Duration::from_secs(2),
            storage_cleanup_interval: Duration::from_secs(1),
            ..Settings::default()
        });
        cache.store(segment("v", "A"), Bytes::from_static(b"a"));
        let cancel = CancellationToken::new();
        let task = cache.spawn_cleanup(cancel.clone());

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(cache.is_empty());

        cancel.cancel();
        task.await.unwrap();
    }
}
