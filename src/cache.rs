//! Similarity cache
//!
//! Process-local, TTL-bounded store of pairwise similarity judgments keyed by
//! an order-independent pair key. Concurrent requests for the same pair share
//! a single in-flight computation.

use crate::oracle::SimilarityVerdict;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, OnceCell};

/// Unordered pair of theme ids. The lexically lower id is always stored first,
/// so `PairKey::new(a, b) == PairKey::new(b, a)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    low: String,
    high: String,
}

impl PairKey {
    pub fn new(a: &str, b: &str) -> Self {
        if a <= b {
            Self {
                low: a.to_string(),
                high: b.to_string(),
            }
        } else {
            Self {
                low: b.to_string(),
                high: a.to_string(),
            }
        }
    }

    pub fn low(&self) -> &str {
        &self.low
    }

    pub fn high(&self) -> &str {
        &self.high
    }

    pub fn contains(&self, id: &str) -> bool {
        self.low == id || self.high == id
    }
}

impl std::fmt::Display for PairKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.low, self.high)
    }
}

/// Where a similarity record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordSource {
    Oracle,
    /// Excluded by the lexical pre-filter without an oracle call.
    Prefilter,
    /// Conservative default after the oracle failed.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityRecord {
    pub key: PairKey,
    pub combined_score: f64,
    pub name_score: Option<f64>,
    pub file_score: Option<f64>,
    pub should_merge: bool,
    pub reasoning: String,
    pub timestamp: DateTime<Utc>,
    pub source: RecordSource,
}

impl SimilarityRecord {
    pub fn from_verdict(key: PairKey, verdict: SimilarityVerdict, source: RecordSource) -> Self {
        Self {
            key,
            combined_score: verdict.combined_score,
            name_score: verdict.name_score,
            file_score: verdict.file_score,
            should_merge: verdict.should_merge,
            reasoning: verdict.reasoning,
            timestamp: Utc::now(),
            source,
        }
    }

    fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now.signed_duration_since(self.timestamp) < ttl
    }
}

/// One in-flight computation. The owner sets `result` once; waiters park on
/// `ready` until it is there.
#[derive(Debug, Default)]
struct Slot {
    result: OnceCell<Option<SimilarityRecord>>,
    ready: Notify,
}

impl Slot {
    async fn wait(&self) -> Option<SimilarityRecord> {
        loop {
            let notified = self.ready.notified();
            if let Some(result) = self.result.get() {
                return result.clone();
            }
            notified.await;
        }
    }
}

/// Outcome of [`SimilarityCache::claim`].
pub enum PairLookup<'c> {
    /// A fresh record was already cached.
    Cached(SimilarityRecord),
    /// The caller now owns the computation and must resolve the ticket.
    Owned(PairTicket<'c>),
    /// Another caller is computing this pair.
    InFlight(PendingPair),
}

/// Ownership of one pair's computation. Dropping an unresolved ticket
/// releases the pair empty, so waiters never hang on a cancelled owner.
pub struct PairTicket<'c> {
    cache: &'c SimilarityCache,
    key: PairKey,
    slot: Arc<Slot>,
    resolved: bool,
}

impl PairTicket<'_> {
    pub fn key(&self) -> &PairKey {
        &self.key
    }

    /// Publish the result to waiters; `Some` is also cached.
    pub fn resolve(mut self, result: Option<SimilarityRecord>) {
        self.resolved = true;
        self.cache.finish(&self.key, &self.slot, result);
    }
}

impl Drop for PairTicket<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.cache.finish(&self.key, &self.slot, None);
        }
    }
}

/// A pair someone else is computing.
pub struct PendingPair {
    key: PairKey,
    slot: Arc<Slot>,
}

impl PendingPair {
    pub fn key(&self) -> &PairKey {
        &self.key
    }

    /// The owner's result; `None` when its computation failed.
    pub async fn wait(self) -> Option<SimilarityRecord> {
        self.slot.wait().await
    }
}

/// Counters exposed for metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    /// Computations actually started (coalesced waiters are not counted).
    pub computations: usize,
}

pub struct SimilarityCache {
    ttl: Duration,
    entries: Mutex<HashMap<PairKey, SimilarityRecord>>,
    in_flight: Mutex<HashMap<PairKey, Arc<Slot>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
    computations: AtomicUsize,
}

impl std::fmt::Debug for SimilarityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimilarityCache")
            .field("ttl_minutes", &self.ttl.num_minutes())
            .field("len", &self.len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SimilarityCache {
    pub fn new(ttl_minutes: i64) -> Self {
        Self {
            ttl: Duration::minutes(ttl_minutes.max(1)),
            entries: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            computations: AtomicUsize::new(0),
        }
    }

    /// Fresh record for the pair, if any. Expired records are evicted.
    pub fn get(&self, key: &PairKey) -> Option<SimilarityRecord> {
        let mut entries = lock(&self.entries);
        let now = Utc::now();
        match entries.get(key) {
            Some(record) if record.is_fresh(now, self.ttl) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(record.clone())
            }
            Some(_) => {
                entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, record: SimilarityRecord) {
        lock(&self.entries).insert(record.key.clone(), record);
    }

    /// Look the pair up and, when nobody has it, take ownership of computing
    /// it. Lookup and registration happen under one lock, so a pair has at
    /// most one owner at a time across every caller sharing this cache.
    pub fn claim(&self, key: &PairKey) -> PairLookup<'_> {
        let mut in_flight = lock(&self.in_flight);
        if let Some(record) = self.get(key) {
            return PairLookup::Cached(record);
        }
        if let Some(slot) = in_flight.get(key) {
            return PairLookup::InFlight(PendingPair {
                key: key.clone(),
                slot: slot.clone(),
            });
        }
        let slot = Arc::new(Slot::default());
        in_flight.insert(key.clone(), slot.clone());
        self.computations.fetch_add(1, Ordering::Relaxed);
        PairLookup::Owned(PairTicket {
            cache: self,
            key: key.clone(),
            slot,
            resolved: false,
        })
    }

    fn finish(&self, key: &PairKey, slot: &Arc<Slot>, result: Option<SimilarityRecord>) {
        if let Some(record) = &result {
            self.insert(record.clone());
        }
        let _ = slot.result.set(result);
        {
            let mut in_flight = lock(&self.in_flight);
            if in_flight
                .get(key)
                .map(|current| Arc::ptr_eq(current, slot))
                .unwrap_or(false)
            {
                in_flight.remove(key);
            }
        }
        slot.ready.notify_waiters();
    }

    /// Cached record, or the result of `compute`. Concurrent callers for the
    /// same key await one shared computation; a `None` result is not cached.
    pub async fn get_or_compute<F, Fut>(&self, key: &PairKey, compute: F) -> Option<SimilarityRecord>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<SimilarityRecord>>,
    {
        match self.claim(key) {
            PairLookup::Cached(record) => Some(record),
            PairLookup::InFlight(pending) => pending.wait().await,
            PairLookup::Owned(ticket) => {
                let result = compute().await;
                ticket.resolve(result.clone());
                result
            }
        }
    }

    /// Drop every expired record.
    pub fn cleanup(&self) {
        let now = Utc::now();
        let ttl = self.ttl;
        lock(&self.entries).retain(|_, record| record.is_fresh(now, ttl));
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            computations: self.computations.load(Ordering::Relaxed),
        }
    }
}
