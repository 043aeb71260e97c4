//! Storage key derivation from chat-platform user ids.
//!
//! The integrity of the whole system hinges on never letting a
//! client-generated placeholder id silently alias a real user's storage key,
//! so every external id passes through [`RecordKey::resolve`] before it is
//! used anywhere.

use std::fmt;

use crate::types::{Result, SyncError};

/// Shortest id the chat platform hands out for a real user
pub const MIN_EXTERNAL_ID_LEN: usize = 5;

/// Prefixes of locally generated fallback/anonymous ids
const SYNTHETIC_PREFIXES: [&str; 3] = ["anon-", "guest-", "local-"];

/// A validated storage key for one user record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey(String);

impl RecordKey {
    /// Derive the canonical storage key from an external id.
    ///
    /// Rejects empty ids, synthetic/fallback ids, ids shorter than the
    /// platform minimum, and ids containing anything but decimal digits.
    /// No side effects.
    pub fn resolve(external_id: &str) -> Result<Self> {
        if external_id.is_empty() {
            return Err(SyncError::InvalidKey("empty id".to_string()));
        }

        let lowered = external_id.to_ascii_lowercase();
        for prefix in SYNTHETIC_PREFIXES {
            if lowered.starts_with(prefix) {
                return Err(SyncError::InvalidKey(format!(
                    "synthetic id: {external_id}"
                )));
            }
        }

        if external_id.len() < MIN_EXTERNAL_ID_LEN {
            return Err(SyncError::InvalidKey(format!(
                "id shorter than platform minimum: {external_id}"
            )));
        }

        if !external_id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SyncError::InvalidKey(format!(
                "non-numeric id: {external_id}"
            )));
        }

        Ok(Self(external_id.to_string()))
    }

    /// The validated external id
    pub fn external_id(&self) -> &str {
        &self.0
    }

    /// Storage path for this record
    pub fn path(&self) -> String {
        format!("users/{}", self.0)
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_real_ids() {
        let key = RecordKey::resolve("123456789").unwrap();
        assert_eq!(key.external_id(), "123456789");
        assert_eq!(key.path(), "users/123456789");
    }

    #[test]
    fn rejects_empty() {
        assert!(matches!(
            RecordKey::resolve(""),
            Err(SyncError::InvalidKey(_))
        ));
    }

    #[test]
    fn rejects_synthetic_ids() {
        for id in ["anon-12345", "guest-99999", "local-31337", "ANON-12345"] {
            assert!(
                matches!(RecordKey::resolve(id), Err(SyncError::InvalidKey(_))),
                "{id} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_short_ids() {
        assert!(matches!(
            RecordKey::resolve("1234"),
            Err(SyncError::InvalidKey(_))
        ));
    }

    #[test]
    fn rejects_non_numeric_ids() {
        assert!(matches!(
            RecordKey::resolve("12345abc"),
            Err(SyncError::InvalidKey(_))
        ));
        assert!(matches!(
            RecordKey::resolve("  123456"),
            Err(SyncError::InvalidKey(_))
        ));
    }
}
