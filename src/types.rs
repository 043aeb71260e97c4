//! Crate-wide error taxonomy.

use std::time::Duration;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Error types for sync operations.
///
/// `AlreadyApplied` is deliberately *not* here: a duplicate reward delivery
/// is a successful no-op, reported through
/// [`crate::rewards::RewardOutcome::AlreadyApplied`].
#[derive(Debug, Error)]
pub enum SyncError {
    /// External id is empty, synthetic, or otherwise unusable as a storage key
    #[error("invalid external id: {0}")]
    InvalidKey(String),

    /// Sanitization found a write that would corrupt the stored schema
    #[error("malformed write: {0}")]
    MalformedWrite(String),

    /// A local pre-check failed; the mirror and the store were not touched
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The store or the network is down
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Point read on a missing key
    #[error("record not found: {0}")]
    NotFound(String),

    /// The store rejected the operation (permissions or server-side validation)
    #[error("denied by store: {0}")]
    Denied(String),

    /// An authoritative write did not resolve within the configured bound
    #[error("authoritative write timed out after {0:?}")]
    Timeout(Duration),

    /// Durable snapshot load/save failed
    #[error("snapshot persistence failed: {0}")]
    Persistence(String),
}

impl SyncError {
    /// Whether the failure happened before any optimistic mutation could have
    /// been applied. Pre-flight failures never require a rollback.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidKey(_)
                | SyncError::MalformedWrite(_)
                | SyncError::InvariantViolation(_)
        )
    }
}
