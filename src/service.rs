//! Service facade.
//!
//! `SyncService` wires the store adapter, mirror, subscription manager,
//! coordinator, and reward applier into the surface route handlers call. It
//! is an explicit object with an explicit lifecycle - constructed by the
//! hosting process, torn down with [`SyncService::shutdown`] - rather than a
//! module-level singleton.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::coordinator::UpdateCoordinator;
use crate::events::{PaymentNotice, PaymentStatus};
use crate::keys::RecordKey;
use crate::mirror::persist::{self, SnapshotStore};
use crate::mirror::MirrorCache;
use crate::model::{FarmingWindow, ReferralEdge, UserRecord};
use crate::rewards::{RewardApplier, RewardDescriptor, RewardOutcome};
use crate::store::RecordStore;
use crate::subscription::{SubscriptionManager, SubscriptionState, WatchHandle};
use crate::types::{Result, SyncError};

/// Base payout for a completed farming window, before multipliers
pub const FARMING_BASE_PAYOUT: i64 = 480;

/// Base payout for a daily check-in, before the streak scale
pub const CHECK_IN_BASE_PAYOUT: i64 = 10;

/// Connection status exposed to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub online: bool,
    /// When the mirror last saw an authoritative value, if ever
    pub last_sync_time: Option<DateTime<Utc>>,
}

/// The sync core, assembled.
pub struct SyncService {
    /// Identifies this process instance (one per tab/device) in logs
    instance_id: Uuid,
    store: Arc<dyn RecordStore>,
    mirror: Arc<MirrorCache>,
    subscriptions: SubscriptionManager,
    coordinator: Arc<UpdateCoordinator>,
    rewards: RewardApplier,
}

impl SyncService {
    pub fn new(store: Arc<dyn RecordStore>, config: SyncConfig) -> Self {
        let mirror = Arc::new(MirrorCache::new(config.watch_buffer));
        let subscriptions =
            SubscriptionManager::new(store.clone(), mirror.clone(), config.clone());
        let coordinator = Arc::new(UpdateCoordinator::new(
            store.clone(),
            mirror.clone(),
            config,
        ));
        let rewards = RewardApplier::new(coordinator.clone());
        let instance_id = Uuid::new_v4();
        info!(%instance_id, "sync service started");
        Self {
            instance_id,
            store,
            mirror,
            subscriptions,
            coordinator,
            rewards,
        }
    }

    /// This process instance's id
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// The mirror, for host glue (cross-tab merges, diagnostics)
    pub fn mirror(&self) -> &Arc<MirrorCache> {
        &self.mirror
    }

    /// The store adapter this service runs against
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    // ------------------------------------------------------------------
    // Watching
    // ------------------------------------------------------------------

    /// Watch one user's record. The handle serves the last-known snapshot
    /// immediately and streams changes in version order.
    pub fn watch_user(&self, external_id: &str) -> Result<WatchHandle> {
        let key = RecordKey::resolve(external_id)?;
        Ok(self.subscriptions.watch(&key))
    }

    /// Forward the host's visibility signal (tab focus/background)
    pub fn set_visibility(&self, visible: bool) {
        self.subscriptions.set_visibility(visible);
    }

    /// Subscription state for one key
    pub fn subscription_state(&self, key: &RecordKey) -> SubscriptionState {
        self.subscriptions.state(key)
    }

    /// Number of keys with a live (or reconnecting) subscription
    pub fn active_watch_keys(&self) -> usize {
        self.subscriptions.active_keys()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        ConnectionStatus {
            online: self.store.connectivity().borrow().online,
            last_sync_time: self.mirror.last_sync_time(),
        }
    }

    // ------------------------------------------------------------------
    // Updates and rewards
    // ------------------------------------------------------------------

    /// Current record for a user, creating nothing.
    pub async fn get_user(&self, external_id: &str) -> Result<UserRecord> {
        let key = RecordKey::resolve(external_id)?;
        self.coordinator.get(&key).await
    }

    /// Apply an arbitrary mutation through the optimistic protocol.
    pub async fn update_user<F>(&self, external_id: &str, mutator: F) -> Result<UserRecord>
    where
        F: FnOnce(&UserRecord) -> Result<UserRecord> + Send,
    {
        let key = RecordKey::resolve(external_id)?;
        self.coordinator.update(&key, mutator).await
    }

    /// Apply a reward exactly once per event id.
    pub async fn apply_reward(
        &self,
        external_id: &str,
        event_id: &str,
        reward: &RewardDescriptor,
    ) -> Result<RewardOutcome> {
        let key = RecordKey::resolve(external_id)?;
        self.rewards.apply(&key, event_id, reward).await
    }

    /// Settle a payment-provider webhook. Only `Paid` notices credit;
    /// anything else is acknowledged without touching the record. Safe to
    /// call for every redelivery.
    pub async fn handle_payment(
        &self,
        notice: &PaymentNotice,
    ) -> Result<Option<RewardOutcome>> {
        if notice.status != PaymentStatus::Paid {
            debug!(
                invoice = %notice.invoice_id,
                status = ?notice.status,
                "ignoring non-settled payment notice"
            );
            return Ok(None);
        }
        if notice.amount <= 0 {
            return Err(SyncError::MalformedWrite(format!(
                "non-positive payment amount {}",
                notice.amount
            )));
        }
        let outcome = self
            .apply_reward(
                &notice.user_id,
                &notice.event_id(),
                &RewardDescriptor::PaymentCredit {
                    amount: notice.amount,
                },
            )
            .await?;
        Ok(Some(outcome))
    }

    /// Confirm a referral edge and credit the referrer exactly once.
    ///
    /// The bonus event id is derived from the referred user, so even a
    /// re-confirmation of an already-confirmed edge cannot double-credit.
    pub async fn confirm_referral(
        &self,
        edge: &mut ReferralEdge,
        amount: i64,
    ) -> Result<RewardOutcome> {
        if !edge.confirm() {
            debug!(referred = %edge.referred, "edge already confirmed");
        }
        self.apply_reward(
            &edge.referrer,
            &edge.bonus_event_id(),
            &RewardDescriptor::ReferralBonus { amount },
        )
        .await
    }

    // ------------------------------------------------------------------
    // Farming and check-ins
    // ------------------------------------------------------------------

    /// Open a farming window. Fails while one is still running.
    pub async fn start_farming(&self, external_id: &str) -> Result<UserRecord> {
        let now = Utc::now();
        self.update_user(external_id, move |current| {
            if let Some(window) = &current.farming_window {
                if !window.is_complete(now) {
                    return Err(SyncError::InvariantViolation(
                        "farming window already active".to_string(),
                    ));
                }
            }
            let mut next = current.clone();
            next.farming_window = Some(FarmingWindow::open(now));
            Ok(next)
        })
        .await
    }

    /// Claim a completed farming window. The claim is keyed by the window's
    /// start time, so a double-click or a retried request pays out once.
    pub async fn claim_farming(&self, external_id: &str) -> Result<RewardOutcome> {
        let key = RecordKey::resolve(external_id)?;
        let current = self.coordinator.get(&key).await?;

        let window = current.farming_window.ok_or_else(|| {
            SyncError::InvariantViolation("no farming window to claim".to_string())
        })?;
        if !window.is_complete(Utc::now()) {
            return Err(SyncError::InvariantViolation(
                "farming window still running".to_string(),
            ));
        }

        self.rewards
            .apply(
                &key,
                &window.claim_event_id(),
                &RewardDescriptor::FarmingClaim {
                    amount: FARMING_BASE_PAYOUT,
                },
            )
            .await
    }

    /// Daily check-in, once per calendar day per user.
    pub async fn daily_check_in(&self, external_id: &str) -> Result<RewardOutcome> {
        let key = RecordKey::resolve(external_id)?;
        let event_id = format!("daily:{}", Utc::now().date_naive());
        self.rewards
            .apply(
                &key,
                &event_id,
                &RewardDescriptor::DailyCheckIn {
                    base_amount: CHECK_IN_BASE_PAYOUT,
                },
            )
            .await
    }

    // ------------------------------------------------------------------
    // Durable mirror
    // ------------------------------------------------------------------

    /// Persist the mirror to durable storage.
    pub async fn persist_mirror(&self, snapshots: &dyn SnapshotStore) -> Result<()> {
        let entries = persist::to_persisted(self.mirror.entries_snapshot());
        snapshots.save(&entries).await?;
        debug!(entries = entries.len(), "mirror persisted");
        Ok(())
    }

    /// Restore the mirror from durable storage, then refresh stale entries
    /// in the background instead of trusting them as current.
    pub async fn restore_mirror(
        &self,
        snapshots: &dyn SnapshotStore,
        staleness: std::time::Duration,
    ) -> Result<()> {
        let entries = persist::from_persisted(snapshots.load().await?);
        let restored = entries.len();
        let stale = self
            .mirror
            .restore_entries(entries, staleness, Utc::now());
        info!(restored, stale = stale.len(), "mirror restored");

        if !stale.is_empty() {
            let coordinator = self.coordinator.clone();
            tokio::spawn(async move {
                let refreshes = stale.iter().map(|key| {
                    let coordinator = coordinator.clone();
                    async move {
                        if let Err(e) = coordinator.refresh(key).await {
                            warn!(%key, error = %e, "background refresh failed");
                        }
                    }
                });
                futures::future::join_all(refreshes).await;
            });
        }
        Ok(())
    }

    /// Tear the service down: close every live subscription.
    pub fn shutdown(&self) {
        info!(instance_id = %self.instance_id, "sync service shutting down");
        self.subscriptions.shutdown();
    }
}
