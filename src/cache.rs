use crate::types::CveRecord;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

struct CacheEntry {
    record: CveRecord,
    lookups: AtomicU64,
    last_looked_up: RwLock<Option<DateTime<Utc>>>,
}

/// Lookup statistics for one cached identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheObservation {
    pub lookups: u64,
    pub last_looked_up: Option<DateTime<Utc>>,
}

/// TTL cache of enriched vulnerability records keyed by identifier.
///
/// Reads never wait on the network: callers fetch outside the cache and
/// upsert the result, last writer wins.
pub struct VulnerabilityCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl VulnerabilityCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Expiry for a record written at `now`.
    pub fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.ttl
    }

    /// Non-expired record for `id`; counts as a lookup.
    pub fn get_fresh(&self, id: &str) -> Option<CveRecord> {
        let now = Utc::now();
        let entries = self.entries.read();
        let entry = entries.get(id)?;
        if entry.record.is_expired_at(now) {
            return None;
        }

        entry.lookups.fetch_add(1, Ordering::Relaxed);
        *entry.last_looked_up.write() = Some(now);
        Some(entry.record.clone())
    }

    /// Record for `id` regardless of expiry, without counting a lookup.
    pub fn peek(&self, id: &str) -> Option<CveRecord> {
        self.entries.read().get(id).map(|e| e.record.clone())
    }

    /// Insert or replace the record for `record.id`; lookup counters survive.
    pub fn upsert(&self, record: CveRecord) {
        let mut entries = self.entries.write();
        match entries.get_mut(&record.id) {
            Some(entry) => entry.record = record,
            None => {
                entries.insert(
                    record.id.clone(),
                    CacheEntry {
                        record,
                        lookups: AtomicU64::new(0),
                        last_looked_up: RwLock::new(None),
                    },
                );
            }
        }
    }

    pub fn observation(&self, id: &str) -> Option<CacheObservation> {
        self.entries.read().get(id).map(|e| CacheObservation {
            lookups: e.lookups.load(Ordering::Relaxed),
            last_looked_up: *e.last_looked_up.read(),
        })
    }

    /// Drop expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| !e.record.is_expired_at(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
