//! Local mirror cache.
//!
//! Holds the last-known snapshot of each user record, tagged with its source
//! and a per-key monotonic version counter. All consumers - UI watchers,
//! the optimistic coordinator, the subscription manager - observe records
//! through the mirror, which is what keeps every surface in one process
//! consistent.
//!
//! Versions, not wall clocks, decide conflicts: a lower-version entry
//! arriving after a higher-version one is discarded, which tolerates clock
//! skew between tabs and devices.

pub mod persist;

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::keys::RecordKey;
use crate::model::UserRecord;

// ============================================================================
// Entries
// ============================================================================

/// Where a mirror entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorSource {
    /// Confirmed by the store (a push delivery or a committed write)
    Authoritative,
    /// A tentative local mutation awaiting confirmation
    Optimistic,
    /// Restored from a durable snapshot and past the staleness threshold
    Cached,
}

/// One cached record snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorEntry {
    pub record: UserRecord,
    pub captured_at: DateTime<Utc>,
    pub source: MirrorSource,
    pub version: u64,
}

impl MirrorEntry {
    /// Age of this snapshot at `now`
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.captured_at).to_std().unwrap_or(Duration::ZERO)
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Counters for cache behavior.
#[derive(Debug, Default)]
pub struct MirrorStats {
    hits: AtomicU64,
    misses: AtomicU64,
    updates: AtomicU64,
    discarded: AtomicU64,
}

impl MirrorStats {
    pub fn snapshot(&self) -> MirrorStatsSnapshot {
        MirrorStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`MirrorStats`].
#[derive(Debug, Clone, Copy)]
pub struct MirrorStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub updates: u64,
    /// Entries dropped by the version check (stale cross-process writes)
    pub discarded: u64,
}

// ============================================================================
// Cache
// ============================================================================

/// Per-record snapshot cache with change fan-out.
pub struct MirrorCache {
    entries: DashMap<RecordKey, MirrorEntry>,
    channels: DashMap<RecordKey, broadcast::Sender<MirrorEntry>>,
    stats: MirrorStats,
    buffer: usize,
    /// Millis of the most recent authoritative update; 0 = never synced
    last_authoritative_ms: AtomicI64,
}

impl MirrorCache {
    pub fn new(buffer: usize) -> Self {
        Self {
            entries: DashMap::new(),
            channels: DashMap::new(),
            stats: MirrorStats::default(),
            buffer,
            last_authoritative_ms: AtomicI64::new(0),
        }
    }

    /// Current entry for a key
    pub fn get(&self, key: &RecordKey) -> Option<MirrorEntry> {
        match self.entries.get(key) {
            Some(entry) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.clone())
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Record a local or remote mutation. The version is always the current
    /// version plus one, so listeners observe a strictly increasing
    /// sequence per key.
    pub fn record_update(
        &self,
        key: &RecordKey,
        record: UserRecord,
        source: MirrorSource,
    ) -> MirrorEntry {
        let now = Utc::now();
        let entry = {
            let mut slot = self.entries.entry(key.clone()).or_insert_with(|| MirrorEntry {
                record: record.clone(),
                captured_at: now,
                source,
                version: 0,
            });
            let next = MirrorEntry {
                record,
                captured_at: now,
                source,
                version: slot.version + 1,
            };
            *slot = next.clone();
            next
        };

        if source == MirrorSource::Authoritative {
            self.last_authoritative_ms
                .store(now.timestamp_millis(), Ordering::Relaxed);
        }
        self.stats.updates.fetch_add(1, Ordering::Relaxed);
        self.publish(key, &entry);
        entry
    }

    /// Merge an entry produced by another process (another tab's mirror).
    /// Last writer wins by version; stale entries are discarded. Returns
    /// whether the entry was accepted.
    pub fn merge_external(&self, key: &RecordKey, entry: MirrorEntry) -> bool {
        let accepted = match self.entries.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut current) => {
                if entry.version > current.get().version {
                    current.insert(entry.clone());
                    true
                } else {
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(entry.clone());
                true
            }
        };

        if accepted {
            self.stats.updates.fetch_add(1, Ordering::Relaxed);
            self.publish(key, &entry);
        } else {
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
            debug!(%key, version = entry.version, "discarded stale external entry");
        }
        accepted
    }

    /// Drop a key's entry entirely (e.g. rollback of a record that never
    /// existed upstream)
    pub fn invalidate(&self, key: &RecordKey) {
        self.entries.remove(key);
    }

    /// Subscribe to this key's change feed
    pub fn subscribe_changes(&self, key: &RecordKey) -> broadcast::Receiver<MirrorEntry> {
        self.channels
            .entry(key.clone())
            .or_insert_with(|| broadcast::channel(self.buffer).0)
            .subscribe()
    }

    pub fn stats(&self) -> MirrorStatsSnapshot {
        self.stats.snapshot()
    }

    /// When the mirror last saw an authoritative value, if ever
    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        match self.last_authoritative_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All current entries (durable snapshot source)
    pub fn entries_snapshot(&self) -> Vec<(RecordKey, MirrorEntry)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Restore entries saved by a previous process. Entries older than
    /// `staleness` are demoted to `Cached` and returned so the caller can
    /// refresh them in the background; fresher ones keep their tag. Never
    /// overwrites an entry the running process already has.
    pub fn restore_entries(
        &self,
        entries: Vec<(RecordKey, MirrorEntry)>,
        staleness: Duration,
        now: DateTime<Utc>,
    ) -> Vec<RecordKey> {
        let mut needs_refresh = Vec::new();
        for (key, mut entry) in entries {
            if self.entries.contains_key(&key) {
                continue;
            }
            if entry.age(now) > staleness {
                entry.source = MirrorSource::Cached;
                needs_refresh.push(key.clone());
            }
            // An optimistic snapshot from a dead process was never
            // confirmed; don't let it masquerade as truth
            if entry.source == MirrorSource::Optimistic {
                warn!(%key, "restored unconfirmed optimistic entry, demoting");
                entry.source = MirrorSource::Cached;
                if !needs_refresh.contains(&key) {
                    needs_refresh.push(key.clone());
                }
            }
            self.entries.insert(key, entry);
        }
        needs_refresh
    }

    fn publish(&self, key: &RecordKey, entry: &MirrorEntry) {
        if let Some(sender) = self.channels.get(key) {
            // Send only fails when no receiver is attached, which is fine
            let _ = sender.send(entry.clone());
        }
    }
}
