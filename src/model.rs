//! Domain records for the rewards economy.
//!
//! `UserRecord` is the single mutable entity at the center of the system.
//! All monetary amounts are integer coin counts; multipliers are exact
//! rationals so repeated application never accumulates float error.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::keys::RecordKey;
use crate::types::{Result, SyncError};

/// Experience required per level
pub const XP_PER_LEVEL: u64 = 500;

/// Length of one farming window
pub const FARMING_WINDOW_HOURS: i64 = 8;

// ============================================================================
// Tiers and multipliers
// ============================================================================

/// VIP tier. Stored tier is a hint; reward math always goes through
/// [`UserRecord::effective_tier`] so an expired tier silently falls back to
/// `Free` without a background downgrade job.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Free,
    Tier1,
    Tier2,
}

impl Tier {
    /// Multiplier applied to task and farming payouts
    pub fn reward_multiplier(self) -> Multiplier {
        match self {
            Tier::Free => Multiplier::IDENTITY,
            Tier::Tier1 => Multiplier { num: 3, den: 2 },
            Tier::Tier2 => Multiplier { num: 2, den: 1 },
        }
    }

    /// Multiplier applied to referral bonuses
    pub fn referral_multiplier(self) -> Multiplier {
        match self {
            Tier::Free => Multiplier::IDENTITY,
            Tier::Tier1 => Multiplier { num: 5, den: 4 },
            Tier::Tier2 => Multiplier { num: 3, den: 2 },
        }
    }
}

/// Exact rational multiplier, always >= 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Multiplier {
    pub num: u32,
    pub den: u32,
}

impl Multiplier {
    pub const IDENTITY: Multiplier = Multiplier { num: 1, den: 1 };

    /// Apply to an amount, rounding down
    pub fn apply(self, amount: i64) -> i64 {
        amount * self.num as i64 / self.den as i64
    }
}

// ============================================================================
// Farming window
// ============================================================================

/// An active farming window. Start and end only ever travel together; the
/// half-present state is unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FarmingWindow {
    pub started_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

impl FarmingWindow {
    /// Open a window starting now
    pub fn open(now: DateTime<Utc>) -> Self {
        Self {
            started_at: now,
            ends_at: now + chrono::Duration::hours(FARMING_WINDOW_HOURS),
        }
    }

    /// Whether the window has run to completion and can be claimed
    pub fn is_complete(&self, now: DateTime<Utc>) -> bool {
        now >= self.ends_at
    }

    /// Deterministic idempotence key for claiming this window
    pub fn claim_event_id(&self) -> String {
        format!("farming:{}", self.started_at.timestamp())
    }
}

// ============================================================================
// User record
// ============================================================================

/// The per-user economic record.
///
/// `balance` is signed so that an over-debit is representable long enough to
/// be rejected by [`UserRecord::validate`] instead of panicking on underflow;
/// a negative balance never reaches the mirror or the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Immutable identity, derived from the chat-platform user id
    pub external_id: String,

    pub balance: i64,
    pub experience: u64,
    /// Derived from experience, monotonic non-decreasing
    pub level: u32,
    pub daily_streak: u32,
    pub referral_count: u32,
    pub referral_earnings: i64,

    pub tier: Tier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier_expiry: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub farming_window: Option<FarmingWindow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_claim_date: Option<NaiveDate>,

    /// Set on every write; the store overwrites it with its own clock
    pub updated_at: DateTime<Utc>,

    /// Idempotence ledger: reward-event ids already applied to this record
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub applied_event_ids: BTreeSet<String>,
}

impl UserRecord {
    /// Fresh record with defaults, created on first contact
    pub fn new(key: &RecordKey, now: DateTime<Utc>) -> Self {
        Self {
            external_id: key.external_id().to_string(),
            balance: 0,
            experience: 0,
            level: 1,
            daily_streak: 0,
            referral_count: 0,
            referral_earnings: 0,
            tier: Tier::Free,
            tier_expiry: None,
            farming_window: None,
            last_claim_date: None,
            updated_at: now,
            applied_event_ids: BTreeSet::new(),
        }
    }

    /// Level for a given amount of experience
    pub fn level_for_experience(experience: u64) -> u32 {
        (experience / XP_PER_LEVEL) as u32 + 1
    }

    /// Tier in effect at `now`. Past expiry the stored tier is only a hint
    /// and the effective tier is `Free` (lazy expiry).
    pub fn effective_tier(&self, now: DateTime<Utc>) -> Tier {
        if self.tier == Tier::Free {
            return Tier::Free;
        }
        match self.tier_expiry {
            Some(expiry) if expiry > now => self.tier,
            _ => Tier::Free,
        }
    }

    /// Reward multiplier in effect at `now`
    pub fn reward_multiplier(&self, now: DateTime<Utc>) -> Multiplier {
        self.effective_tier(now).reward_multiplier()
    }

    /// Referral multiplier in effect at `now`
    pub fn referral_multiplier(&self, now: DateTime<Utc>) -> Multiplier {
        self.effective_tier(now).referral_multiplier()
    }

    /// Copy with `amount` added to the balance
    pub fn credited(&self, amount: i64) -> Self {
        let mut next = self.clone();
        next.balance += amount;
        next
    }

    /// Copy with `amount` removed from the balance. May produce a negative
    /// balance; validation rejects it before anything observes it.
    pub fn debited(&self, amount: i64) -> Self {
        let mut next = self.clone();
        next.balance -= amount;
        next
    }

    /// Add experience and recompute the level. The level never goes down.
    pub fn add_experience(&mut self, experience: u64) {
        self.experience += experience;
        self.level = self.level.max(Self::level_for_experience(self.experience));
    }

    /// Local invariant check, run before any mutation becomes visible.
    pub fn validate(&self) -> Result<()> {
        if self.external_id.is_empty() {
            return Err(SyncError::InvariantViolation(
                "record without external id".to_string(),
            ));
        }
        if self.balance < 0 {
            return Err(SyncError::InvariantViolation(format!(
                "balance would become negative ({})",
                self.balance
            )));
        }
        if self.referral_earnings < 0 {
            return Err(SyncError::InvariantViolation(
                "referral earnings would become negative".to_string(),
            ));
        }
        if self.tier != Tier::Free && self.tier_expiry.is_none() {
            return Err(SyncError::InvariantViolation(format!(
                "tier {:?} without expiry",
                self.tier
            )));
        }
        if self.level < Self::level_for_experience(0) {
            return Err(SyncError::InvariantViolation(
                "level below floor".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Referral edges
// ============================================================================

/// Referral relationship status. `Pending -> Confirmed` is one-way and
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralStatus {
    Pending,
    Confirmed,
}

/// Derived relationship: `referred -> referrer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralEdge {
    pub referred: String,
    pub referrer: String,
    pub status: ReferralStatus,
}

impl ReferralEdge {
    pub fn new(referred: &str, referrer: &str) -> Self {
        Self {
            referred: referred.to_string(),
            referrer: referrer.to_string(),
            status: ReferralStatus::Pending,
        }
    }

    /// Transition to `Confirmed`. Returns `true` only on the first call.
    pub fn confirm(&mut self) -> bool {
        match self.status {
            ReferralStatus::Pending => {
                self.status = ReferralStatus::Confirmed;
                true
            }
            ReferralStatus::Confirmed => false,
        }
    }

    /// Idempotence key for the referrer's bonus. Keyed by the referred user,
    /// so re-confirming the same edge can never credit twice.
    pub fn bonus_event_id(&self) -> String {
        format!("referral:{}", self.referred)
    }
}
