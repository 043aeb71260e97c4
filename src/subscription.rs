//! Subscription manager.
//!
//! Owns the live push subscription per record: exactly one store
//! subscription per key per process, fanned out to any number of local
//! watchers through the mirror's change channels. Loss of the live channel
//! is never fatal - the key degrades to serving the last-known mirror entry
//! while a reconnect loop retries with exponential backoff and jitter,
//! forever, as long as at least one watcher remains.
//!
//! Per-key state machine:
//!
//! ```text
//! Unsubscribed -> Subscribing -> Active -> (connectivity loss) -> Degraded
//!       ^                          ^                                |
//!       |                          +------- (reconnect) -----------+
//!       +--- (zero watchers) ---------------------------------------
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::keys::RecordKey;
use crate::mirror::{MirrorCache, MirrorEntry, MirrorSource};
use crate::store::RecordStore;

/// Lifecycle of one key's live subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Active,
    /// Live channel lost; serving the last-known mirror while reconnecting
    Degraded,
}

struct KeyWatch {
    watchers: AtomicUsize,
    state: StdMutex<SubscriptionState>,
    /// Poke to skip the current backoff wait (focus return, connectivity up)
    wake: Notify,
    /// Last watcher left; the key task exits
    stop: Notify,
}

impl KeyWatch {
    fn new() -> Self {
        Self {
            watchers: AtomicUsize::new(1),
            state: StdMutex::new(SubscriptionState::Subscribing),
            wake: Notify::new(),
            stop: Notify::new(),
        }
    }

    fn set_state(&self, state: SubscriptionState) {
        *self.state.lock().unwrap() = state;
    }

    fn state(&self) -> SubscriptionState {
        *self.state.lock().unwrap()
    }
}

/// Handle held by one watcher. Dropping it unwatches; dropping the last
/// handle for a key closes the store subscription.
pub struct WatchHandle {
    key: RecordKey,
    rx: broadcast::Receiver<MirrorEntry>,
    last_version: u64,
    snapshot: Option<MirrorEntry>,
    _guard: WatcherGuard,
}

impl WatchHandle {
    pub fn key(&self) -> &RecordKey {
        &self.key
    }

    /// Last-known mirror entry at watch time. Served immediately even while
    /// the subscription is degraded - no loading spinner.
    pub fn snapshot(&self) -> Option<&MirrorEntry> {
        self.snapshot.as_ref()
    }

    /// Next change, in non-decreasing version order. Deliveries carrying a
    /// version at or below the last observed one are dropped. `None` when
    /// the feed is closed.
    pub async fn recv(&mut self) -> Option<MirrorEntry> {
        loop {
            match self.rx.recv().await {
                Ok(entry) if entry.version > self.last_version => {
                    self.last_version = entry.version;
                    return Some(entry);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(key = %self.key, skipped, "watcher lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

struct WatcherGuard {
    key: RecordKey,
    watch: Arc<KeyWatch>,
    keys: Arc<DashMap<RecordKey, Arc<KeyWatch>>>,
}

impl Drop for WatcherGuard {
    fn drop(&mut self) {
        if self.watch.watchers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.watch.set_state(SubscriptionState::Unsubscribed);
            self.keys
                .remove_if(&self.key, |_, v| Arc::ptr_eq(v, &self.watch));
            self.watch.stop.notify_one();
        }
    }
}

/// One live subscription per key, shared by all local watchers.
pub struct SubscriptionManager {
    store: Arc<dyn RecordStore>,
    mirror: Arc<MirrorCache>,
    config: SyncConfig,
    keys: Arc<DashMap<RecordKey, Arc<KeyWatch>>>,
    hidden_since: StdMutex<Option<Instant>>,
}

impl SubscriptionManager {
    pub fn new(
        store: Arc<dyn RecordStore>,
        mirror: Arc<MirrorCache>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            mirror,
            config,
            keys: Arc::new(DashMap::new()),
            hidden_since: StdMutex::new(None),
        }
    }

    /// Register a watcher for one record. The first watcher opens the store
    /// subscription; the returned handle serves the current mirror entry
    /// immediately and streams changes after it.
    pub fn watch(&self, key: &RecordKey) -> WatchHandle {
        let rx = self.mirror.subscribe_changes(key);
        let snapshot = self.mirror.get(key);
        let last_version = snapshot.as_ref().map(|e| e.version).unwrap_or(0);

        let watch = loop {
            match self.keys.entry(key.clone()) {
                dashmap::mapref::entry::Entry::Occupied(existing) => {
                    let watch = existing.get().clone();
                    // Join only a live registration: the count may already
                    // have hit zero, in which case the key task is tearing
                    // itself down and we must not attach to it
                    let joined = watch
                        .watchers
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                            if n == 0 {
                                None
                            } else {
                                Some(n + 1)
                            }
                        })
                        .is_ok();
                    if joined {
                        break watch;
                    }
                    drop(existing);
                    self.keys.remove_if(key, |_, v| Arc::ptr_eq(v, &watch));
                }
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    let watch = Arc::new(KeyWatch::new());
                    vacant.insert(watch.clone());
                    tokio::spawn(run_key(
                        self.store.clone(),
                        self.mirror.clone(),
                        self.config.clone(),
                        key.clone(),
                        watch.clone(),
                    ));
                    break watch;
                }
            }
        };

        WatchHandle {
            key: key.clone(),
            rx,
            last_version,
            snapshot,
            _guard: WatcherGuard {
                key: key.clone(),
                watch,
                keys: self.keys.clone(),
            },
        }
    }

    /// Current subscription state for a key.
    pub fn state(&self, key: &RecordKey) -> SubscriptionState {
        self.keys
            .get(key)
            .map(|watch| watch.state())
            .unwrap_or(SubscriptionState::Unsubscribed)
    }

    /// Host visibility signal.
    ///
    /// A hide followed by a show within the debounce window is focus
    /// flicker and does nothing. A genuine background/foreground transition
    /// pokes every key's reconnect loop - but only if the connectivity
    /// signal agrees we are online.
    pub fn set_visibility(&self, visible: bool) {
        let mut hidden = self.hidden_since.lock().unwrap();
        if !visible {
            if hidden.is_none() {
                *hidden = Some(Instant::now());
            }
            return;
        }
        let Some(since) = hidden.take() else {
            return;
        };
        if since.elapsed() < self.config.background_debounce {
            return;
        }
        if !self.store.connectivity().borrow().online {
            debug!("foreground while offline, waiting for connectivity");
            return;
        }
        info!("foreground after background, poking reconnects");
        for entry in self.keys.iter() {
            entry.value().wake.notify_one();
        }
    }

    /// Number of keys with a live (or reconnecting) subscription.
    pub fn active_keys(&self) -> usize {
        self.keys.len()
    }

    /// Stop every key task. Watch handles keep serving their last snapshot
    /// but receive no further changes.
    pub fn shutdown(&self) {
        for entry in self.keys.iter() {
            entry.value().set_state(SubscriptionState::Unsubscribed);
            entry.value().stop.notify_one();
        }
        self.keys.clear();
    }
}

/// Per-key subscription task: subscribe, pump changes into the mirror,
/// reconnect on loss.
async fn run_key(
    store: Arc<dyn RecordStore>,
    mirror: Arc<MirrorCache>,
    config: SyncConfig,
    key: RecordKey,
    watch: Arc<KeyWatch>,
) {
    let mut conn = store.connectivity();
    let mut attempt: u32 = 0;

    loop {
        // No point dialing while offline; wait for the signal to flip
        while !conn.borrow().online {
            watch.set_state(SubscriptionState::Degraded);
            tokio::select! {
                changed = conn.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = watch.stop.notified() => return,
            }
        }

        watch.set_state(SubscriptionState::Subscribing);
        match store.subscribe(&key).await {
            Ok(mut subscription) => {
                watch.set_state(SubscriptionState::Active);
                attempt = 0;
                info!(%key, "live subscription established");

                loop {
                    tokio::select! {
                        event = subscription.next() => match event {
                            Some(event) => {
                                mirror.record_update(
                                    &key,
                                    event.record,
                                    MirrorSource::Authoritative,
                                );
                            }
                            None => {
                                warn!(%key, "live channel closed");
                                break;
                            }
                        },
                        changed = conn.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            if !conn.borrow().online {
                                debug!(%key, "connectivity lost");
                                break;
                            }
                        }
                        _ = watch.stop.notified() => return,
                    }
                }
            }
            Err(e) => {
                warn!(%key, error = %e, attempt, "subscribe failed");
            }
        }

        // Degraded: keep serving the mirror, retry with capped backoff.
        // Retries are unbounded while a watcher remains.
        watch.set_state(SubscriptionState::Degraded);
        let delay = config.reconnect_delay(attempt);
        attempt = attempt.saturating_add(1);
        debug!(%key, ?delay, attempt, "scheduling reconnect");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = watch.wake.notified() => {
                debug!(%key, "reconnect poked");
            }
            changed = conn.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = watch.stop.notified() => return,
        }
    }
}
