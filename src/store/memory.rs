//! In-memory reference store.
//!
//! Stands in for the hosted document store in tests and local development.
//! Documents are held in wire form (JSON objects) so the sanitizer's patch
//! semantics are exercised exactly as a remote store would apply them.
//! Partial updates run read-modify-write under a per-key mutex.
//!
//! Fault injection knobs let tests script outages: flip the store offline,
//! fail or deny the next N writes, or delay writes past the caller's
//! timeout.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

use super::{Connectivity, RecordStore, StoreEvent, StoreSubscription};
use crate::keys::RecordKey;
use crate::model::UserRecord;
use crate::sanitize::{self, RecordPatch};
use crate::types::{Result, SyncError};

/// Buffered events per subscriber before the store drops the subscription
const SUBSCRIPTION_BUFFER: usize = 32;

/// In-memory document store with push notifications.
pub struct MemoryStore {
    documents: DashMap<RecordKey, Value>,
    patch_locks: DashMap<RecordKey, Arc<Mutex<()>>>,
    subscribers: DashMap<RecordKey, Vec<mpsc::Sender<StoreEvent>>>,
    connectivity_tx: watch::Sender<Connectivity>,
    fail_writes: AtomicU32,
    deny_writes: AtomicU32,
    write_delay: std::sync::Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (connectivity_tx, _) = watch::channel(Connectivity::online_now(Utc::now()));
        Self {
            documents: DashMap::new(),
            patch_locks: DashMap::new(),
            subscribers: DashMap::new(),
            connectivity_tx,
            fail_writes: AtomicU32::new(0),
            deny_writes: AtomicU32::new(0),
            write_delay: std::sync::Mutex::new(None),
        }
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    /// Flip the connectivity signal. While offline every call fails with
    /// `Unavailable` and push channels are closed, as a dropped network
    /// connection would.
    pub fn set_online(&self, online: bool) {
        let changed = {
            let current = self.connectivity_tx.borrow();
            current.online != online
        };
        if changed {
            let _ = self.connectivity_tx.send(Connectivity {
                online,
                last_change: Utc::now(),
            });
            if !online {
                // Sever live channels; subscribers see the close and degrade
                self.subscribers.clear();
            }
            debug!(online, "memory store connectivity changed");
        }
    }

    /// Fail the next `n` writes/patches with `Unavailable`
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Deny the next `n` writes/patches with `Denied`
    pub fn deny_next_writes(&self, n: u32) {
        self.deny_writes.store(n, Ordering::SeqCst);
    }

    /// Delay every write/patch by `delay` (None clears)
    pub fn delay_writes(&self, delay: Option<Duration>) {
        *self.write_delay.lock().unwrap() = delay;
    }

    /// Close every push channel without going offline, as a server-side
    /// drop of the live connection would
    pub fn sever_subscriptions(&self) {
        self.subscribers.clear();
        debug!("severed live subscriptions");
    }

    /// Seed a record directly, bypassing the adapter surface (test setup)
    pub fn seed(&self, key: &RecordKey, record: &UserRecord) {
        let document = sanitize::full_document(record).expect("seed record must sanitize");
        self.documents.insert(key.clone(), document);
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn check_online(&self) -> Result<()> {
        if self.connectivity_tx.borrow().online {
            Ok(())
        } else {
            Err(SyncError::Unavailable("store offline".to_string()))
        }
    }

    async fn write_gate(&self) -> Result<()> {
        self.check_online()?;
        let delay = *self.write_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if take_one(&self.fail_writes) {
            return Err(SyncError::Unavailable("injected write failure".to_string()));
        }
        if take_one(&self.deny_writes) {
            return Err(SyncError::Denied("injected write denial".to_string()));
        }
        Ok(())
    }

    fn patch_lock(&self, key: &RecordKey) -> Arc<Mutex<()>> {
        self.patch_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn decode(&self, key: &RecordKey, document: &Value) -> Result<UserRecord> {
        serde_json::from_value(document.clone()).map_err(|e| {
            SyncError::Denied(format!("document for {key} failed validation: {e}"))
        })
    }

    fn notify(&self, key: &RecordKey, record: &UserRecord) {
        let Some(mut senders) = self.subscribers.get_mut(key) else {
            return;
        };
        senders.retain(|sender| {
            let event = StoreEvent {
                key: key.clone(),
                record: record.clone(),
            };
            match sender.try_send(event) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(%key, "subscriber lagging, dropping subscription");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn read(&self, key: &RecordKey) -> Result<UserRecord> {
        self.check_online()?;
        let document = self
            .documents
            .get(key)
            .ok_or_else(|| SyncError::NotFound(key.to_string()))?;
        self.decode(key, document.value())
    }

    async fn write(&self, key: &RecordKey, record: &UserRecord) -> Result<UserRecord> {
        self.write_gate().await?;

        let mut stored = record.clone();
        stored.updated_at = Utc::now();
        let document = sanitize::full_document(&stored)?;
        self.documents.insert(key.clone(), document);
        self.notify(key, &stored);
        debug!(%key, "stored full document");
        Ok(stored)
    }

    async fn patch(&self, key: &RecordKey, patch: &RecordPatch) -> Result<UserRecord> {
        self.write_gate().await?;

        // Native partial-update semantics: read-modify-write under a per-key
        // mutex, so disjoint concurrent patches compose instead of clobbering
        let lock = self.patch_lock(key);
        let _guard = lock.lock().await;

        let mut document = self
            .documents
            .get(key)
            .map(|d| d.value().clone())
            .ok_or_else(|| SyncError::NotFound(key.to_string()))?;

        sanitize::merge_into(&mut document, patch);
        let mut record = self.decode(key, &document)?;
        record.updated_at = Utc::now();
        let document = sanitize::full_document(&record)?;
        self.documents.insert(key.clone(), document);
        self.notify(key, &record);
        debug!(%key, fields = patch.len(), "patched document");
        Ok(record)
    }

    async fn subscribe(&self, key: &RecordKey) -> Result<StoreSubscription> {
        self.check_online()?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        // Current value first, as hosted stores do on attach
        if let Some(document) = self.documents.get(key) {
            let record = self.decode(key, document.value())?;
            let _ = tx.try_send(StoreEvent {
                key: key.clone(),
                record,
            });
        }

        self.subscribers.entry(key.clone()).or_default().push(tx);
        Ok(StoreSubscription::new(rx))
    }

    fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.connectivity_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> RecordKey {
        RecordKey::resolve("123456789").unwrap()
    }

    fn record() -> UserRecord {
        UserRecord::new(&key(), Utc::now())
    }

    #[tokio::test]
    async fn read_missing_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.read(&key()).await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let store = MemoryStore::new();
        let written = store.write(&key(), &record()).await.unwrap();
        let read = store.read(&key()).await.unwrap();
        assert_eq!(written, read);
    }

    #[tokio::test]
    async fn offline_store_is_unavailable() {
        let store = MemoryStore::new();
        store.write(&key(), &record()).await.unwrap();
        store.set_online(false);

        assert!(matches!(
            store.read(&key()).await,
            Err(SyncError::Unavailable(_))
        ));
        assert!(matches!(
            store.write(&key(), &record()).await,
            Err(SyncError::Unavailable(_))
        ));
        store.set_online(true);
        assert!(store.read(&key()).await.is_ok());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemoryStore::new();
        store.write(&key(), &record()).await.unwrap();

        store.fail_next_writes(1);
        assert!(matches!(
            store.write(&key(), &record()).await,
            Err(SyncError::Unavailable(_))
        ));
        assert!(store.write(&key(), &record()).await.is_ok());

        store.deny_next_writes(1);
        assert!(matches!(
            store.write(&key(), &record()).await,
            Err(SyncError::Denied(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_disjoint_patches_compose() {
        let store = Arc::new(MemoryStore::new());
        let base = record();
        store.write(&key(), &base).await.unwrap();

        let balance_patch = sanitize::diff(&base, &base.credited(100)).unwrap();
        let mut with_streak = base.clone();
        with_streak.daily_streak = 7;
        let streak_patch = sanitize::diff(&base, &with_streak).unwrap();

        let k = key();
        let (a, b) = tokio::join!(
            store.patch(&k, &balance_patch),
            store.patch(&k, &streak_patch),
        );
        a.unwrap();
        b.unwrap();

        let merged = store.read(&key()).await.unwrap();
        assert_eq!(merged.balance, 100);
        assert_eq!(merged.daily_streak, 7);
    }

    #[tokio::test]
    async fn subscription_sees_current_value_then_changes() {
        let store = MemoryStore::new();
        let base = record();
        store.write(&key(), &base).await.unwrap();

        let mut sub = store.subscribe(&key()).await.unwrap();
        let first = sub.next().await.unwrap();
        assert_eq!(first.record.balance, 0);

        store.write(&key(), &base.credited(42)).await.unwrap();
        let second = sub.next().await.unwrap();
        assert_eq!(second.record.balance, 42);
    }

    #[tokio::test]
    async fn going_offline_closes_subscriptions() {
        let store = MemoryStore::new();
        store.write(&key(), &record()).await.unwrap();

        let mut sub = store.subscribe(&key()).await.unwrap();
        let _ = sub.next().await.unwrap(); // initial snapshot
        store.set_online(false);

        assert!(sub.next().await.is_none());
    }
}
