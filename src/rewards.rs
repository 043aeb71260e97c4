//! Idempotent reward application.
//!
//! Every economic mutation that can be retried or duplicate-delivered - task
//! claims, farming payouts, daily check-ins, referral bonuses, payment
//! credits, VIP activation - goes through [`RewardApplier::apply`] with an
//! external event id. The check-and-insert against the record's
//! `applied_event_ids` ledger happens inside the mutator the coordinator
//! serializes per key, so two concurrent deliveries of the same event cannot
//! both pass the check before either commits. A failed authoritative write
//! rolls the tentative ledger insert back with the rest of the snapshot,
//! which is what makes a failed attempt safely retryable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::coordinator::UpdateCoordinator;
use crate::keys::RecordKey;
use crate::model::{Tier, UserRecord};
use crate::types::{Result, SyncError};

/// Experience granted alongside every coin reward, per coin
const XP_PER_COIN_NUM: u64 = 1;
const XP_PER_COIN_DEN: u64 = 4;

/// An economic mutation to apply exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RewardDescriptor {
    /// Completed an in-app task
    TaskClaim { amount: i64 },
    /// Claimed a completed farming window
    FarmingClaim { amount: i64 },
    /// Daily check-in; payout scales with the streak
    DailyCheckIn { base_amount: i64 },
    /// A referred user was confirmed; credited to the referrer
    ReferralBonus { amount: i64 },
    /// Real-money payment settled by the payment provider. No multiplier.
    PaymentCredit { amount: i64 },
    /// VIP tier purchase/extension
    VipActivation { tier: Tier, days: i64 },
}

impl RewardDescriptor {
    /// Apply this reward to a record. Pure; the caller owns persistence and
    /// idempotence.
    pub fn apply_to(&self, current: &UserRecord, now: DateTime<Utc>) -> UserRecord {
        let mut next = current.clone();
        match *self {
            RewardDescriptor::TaskClaim { amount } => {
                let credited = current.reward_multiplier(now).apply(amount);
                next.balance += credited;
                next.add_experience(experience_for(credited));
            }
            RewardDescriptor::FarmingClaim { amount } => {
                let credited = current.reward_multiplier(now).apply(amount);
                next.balance += credited;
                next.add_experience(experience_for(credited));
                next.farming_window = None;
            }
            RewardDescriptor::DailyCheckIn { base_amount } => {
                let today = now.date_naive();
                next.daily_streak = match current.last_claim_date {
                    Some(last) if consecutive(last, today) => current.daily_streak + 1,
                    _ => 1,
                };
                let credited = current
                    .reward_multiplier(now)
                    .apply(base_amount * next.daily_streak as i64);
                next.balance += credited;
                next.last_claim_date = Some(today);
            }
            RewardDescriptor::ReferralBonus { amount } => {
                let credited = current.referral_multiplier(now).apply(amount);
                next.balance += credited;
                next.referral_count += 1;
                next.referral_earnings += credited;
            }
            RewardDescriptor::PaymentCredit { amount } => {
                next.balance += amount;
            }
            RewardDescriptor::VipActivation { tier, days } => {
                // Extending the same tier stacks on the remaining time;
                // switching tiers restarts from now
                let base = match current.tier_expiry {
                    Some(expiry) if current.tier == tier && expiry > now => expiry,
                    _ => now,
                };
                next.tier = tier;
                next.tier_expiry = Some(base + chrono::Duration::days(days));
            }
        }
        next
    }
}

fn experience_for(credited: i64) -> u64 {
    (credited.max(0) as u64) * XP_PER_COIN_NUM / XP_PER_COIN_DEN
}

fn consecutive(last: NaiveDate, today: NaiveDate) -> bool {
    last.succ_opt() == Some(today)
}

/// Outcome of an idempotent reward application.
#[derive(Debug, Clone, PartialEq)]
pub enum RewardOutcome {
    /// First delivery; the record reflects the reward
    Applied(UserRecord),
    /// The event id was already in the ledger; nothing changed.
    /// Callers must treat this as success.
    AlreadyApplied,
}

/// Wraps the coordinator with duplicate suppression keyed by an external
/// event id.
pub struct RewardApplier {
    coordinator: Arc<UpdateCoordinator>,
}

impl RewardApplier {
    pub fn new(coordinator: Arc<UpdateCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Apply `reward` to the record at `key` exactly once per `event_id`.
    pub async fn apply(
        &self,
        key: &RecordKey,
        event_id: &str,
        reward: &RewardDescriptor,
    ) -> Result<RewardOutcome> {
        if event_id.is_empty() {
            return Err(SyncError::MalformedWrite("empty reward event id".to_string()));
        }

        let now = Utc::now();
        let duplicate = Arc::new(AtomicBool::new(false));
        let seen = duplicate.clone();
        let event = event_id.to_string();
        let reward = reward.clone();

        let record = self
            .coordinator
            .update(key, move |current| {
                if current.applied_event_ids.contains(&event) {
                    // Identity mutation: the coordinator commits nothing
                    seen.store(true, Ordering::SeqCst);
                    return Ok(current.clone());
                }
                let mut next = reward.apply_to(current, now);
                next.applied_event_ids.insert(event);
                Ok(next)
            })
            .await?;

        if duplicate.load(Ordering::SeqCst) {
            debug!(%key, event_id, "reward already applied");
            Ok(RewardOutcome::AlreadyApplied)
        } else {
            info!(%key, event_id, "reward applied");
            Ok(RewardOutcome::Applied(record))
        }
    }
}
