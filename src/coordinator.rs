//! Optimistic update coordinator.
//!
//! The heart of the core: applies a tentative mutation to the local mirror
//! immediately, issues the authoritative write, and reconciles the mirror on
//! the outcome - commit to the server-confirmed value, or roll back to the
//! exact prior snapshot.
//!
//! Per key, at most one authoritative write is ever in flight; a second
//! update on the same key queues behind it. That serialization is what stops
//! two near-simultaneous claims from both reading the same pre-mutation
//! balance and both committing increments that should have been sequential.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::keys::RecordKey;
use crate::mirror::{MirrorCache, MirrorEntry, MirrorSource};
use crate::model::UserRecord;
use crate::sanitize;
use crate::store::RecordStore;
use crate::types::{Result, SyncError};

/// Serializes optimistic updates per key and reconciles the mirror with the
/// store.
pub struct UpdateCoordinator {
    store: Arc<dyn RecordStore>,
    mirror: Arc<MirrorCache>,
    config: SyncConfig,
    locks: DashMap<RecordKey, Arc<Mutex<()>>>,
}

impl UpdateCoordinator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        mirror: Arc<MirrorCache>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            mirror,
            config,
            locks: DashMap::new(),
        }
    }

    /// Current record for a key: mirror first, store on miss.
    pub async fn get(&self, key: &RecordKey) -> Result<UserRecord> {
        if let Some(entry) = self.mirror.get(key) {
            return Ok(entry.record);
        }
        self.refresh(key).await
    }

    /// Force an authoritative read into the mirror.
    pub async fn refresh(&self, key: &RecordKey) -> Result<UserRecord> {
        let record = self.store.read(key).await?;
        self.mirror
            .record_update(key, record.clone(), MirrorSource::Authoritative);
        Ok(record)
    }

    /// Apply `mutator` to the current record, optimistically then
    /// authoritatively.
    ///
    /// Pre-flight failures (`InvalidKey`, `MalformedWrite`,
    /// `InvariantViolation`, a mutator error) leave the mirror and the store
    /// untouched. A failure of the authoritative write after the optimistic
    /// value became visible rolls the mirror back to the exact prior
    /// snapshot before the error is propagated - callers never observe an
    /// unconfirmed optimistic value after a known failure.
    pub async fn update<F>(&self, key: &RecordKey, mutator: F) -> Result<UserRecord>
    where
        F: FnOnce(&UserRecord) -> Result<UserRecord> + Send,
    {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let (current, existed) = self.current(key).await?;

        let optimistic = mutator(&current)?;
        if optimistic == current {
            // Identity mutation: nothing to write, nothing to notify
            return Ok(current);
        }

        let mut optimistic = optimistic;
        optimistic.updated_at = Utc::now();
        optimistic.validate()?;

        // Sanitize before the mirror is touched so a malformed write is a
        // clean pre-flight rejection, never a rollback
        let patch = sanitize::diff(&current, &optimistic)?;

        let prior: Option<MirrorEntry> = self.mirror.get(key);
        self.mirror
            .record_update(key, optimistic.clone(), MirrorSource::Optimistic);

        let write = async {
            if existed {
                self.store.patch(key, &patch).await
            } else {
                // Full overwrites are reserved for initial record creation
                self.store.write(key, &optimistic).await
            }
        };

        let outcome = match tokio::time::timeout(self.config.write_timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(self.config.write_timeout)),
        };

        match outcome {
            Ok(confirmed) => {
                // The server-confirmed value may legitimately differ (its
                // clock stamps updated_at); it becomes the new truth
                self.mirror
                    .record_update(key, confirmed.clone(), MirrorSource::Authoritative);
                debug!(%key, fields = patch.len(), "authoritative write committed");
                Ok(confirmed)
            }
            Err(e) => {
                warn!(%key, error = %e, "authoritative write failed, rolling back");
                match prior {
                    Some(entry) => {
                        // Restore the exact prior record as last known good;
                        // the version still advances so listeners see the
                        // rollback in order
                        self.mirror.record_update(
                            key,
                            entry.record,
                            MirrorSource::Authoritative,
                        );
                    }
                    None => {
                        // The record never existed upstream; un-create it
                        self.mirror.invalidate(key);
                    }
                }
                Err(e)
            }
        }
    }

    async fn current(&self, key: &RecordKey) -> Result<(UserRecord, bool)> {
        if let Some(entry) = self.mirror.get(key) {
            return Ok((entry.record, true));
        }
        match self.store.read(key).await {
            Ok(record) => {
                self.mirror
                    .record_update(key, record.clone(), MirrorSource::Authoritative);
                Ok((record, true))
            }
            Err(SyncError::NotFound(_)) => {
                // First contact: start from defaults; creation happens with
                // the authoritative write
                Ok((UserRecord::new(key, Utc::now()), false))
            }
            Err(e) => Err(e),
        }
    }

    fn key_lock(&self, key: &RecordKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
