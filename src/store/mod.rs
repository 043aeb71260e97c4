//! Record store adapter.
//!
//! Thin capability interface over the external document store: point read,
//! full write, partial update, push subscription per key, and a connectivity
//! signal. No business logic lives here.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};

use crate::keys::RecordKey;
use crate::model::UserRecord;
use crate::sanitize::RecordPatch;
use crate::types::Result;

pub use memory::MemoryStore;

/// Connectivity state of the underlying store connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connectivity {
    pub online: bool,
    pub last_change: DateTime<Utc>,
}

impl Connectivity {
    pub fn online_now(now: DateTime<Utc>) -> Self {
        Self {
            online: true,
            last_change: now,
        }
    }
}

/// A change pushed by the store for one key.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub key: RecordKey,
    pub record: UserRecord,
}

/// Live push subscription to one key. Dropping it unsubscribes.
pub struct StoreSubscription {
    events: mpsc::Receiver<StoreEvent>,
}

impl StoreSubscription {
    pub fn new(events: mpsc::Receiver<StoreEvent>) -> Self {
        Self { events }
    }

    /// Next pushed change; `None` when the store closed the channel.
    pub async fn next(&mut self) -> Option<StoreEvent> {
        self.events.recv().await
    }
}

/// Capability interface over the external document store.
///
/// `patch` must be atomic from the caller's point of view: concurrent
/// patches to disjoint fields must not clobber each other. Implementations
/// without native partial updates do read-modify-write under a per-key
/// mutex.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Point read. `NotFound` if the key has never been written.
    async fn read(&self, key: &RecordKey) -> Result<UserRecord>;

    /// Full overwrite. Reserved for initial record creation.
    /// Returns the stored record (the store stamps `updated_at`).
    async fn write(&self, key: &RecordKey, record: &UserRecord) -> Result<UserRecord>;

    /// Partial update of only the given fields.
    /// Returns the post-patch record as the store sees it.
    async fn patch(&self, key: &RecordKey, patch: &RecordPatch) -> Result<UserRecord>;

    /// Open a push subscription for one key. The current value, if any, is
    /// delivered as the first event.
    async fn subscribe(&self, key: &RecordKey) -> Result<StoreSubscription>;

    /// Connectivity signal; receivers see every online/offline transition.
    fn connectivity(&self) -> watch::Receiver<Connectivity>;
}
