//! Coinsync - optimistic-update and real-time sync core
//!
//! Coinsync keeps a single mutable per-user economic record correct under
//! concurrent writers and intermittent connectivity. It reconciles a locally
//! cached snapshot, a live push-based subscription feed, and
//! server-authoritative writes against a hosted key-value document store.
//!
//! ## Components
//!
//! - **Store**: capability interface over the external document store, with
//!   an in-memory reference implementation
//! - **Mirror**: durable local snapshot cache with versioned change fan-out
//! - **Subscription**: one live store subscription per record, reconnecting
//!   with backoff and degrading to stale-cache serving
//! - **Coordinator**: optimistic mutations with per-key serialized
//!   authoritative writes and rollback on failure
//! - **Rewards**: idempotent application of economic events keyed by an
//!   external event id

pub mod config;
pub mod coordinator;
pub mod events;
pub mod keys;
pub mod mirror;
pub mod model;
pub mod rewards;
pub mod sanitize;
pub mod service;
pub mod store;
pub mod subscription;
pub mod types;

pub use config::SyncConfig;
pub use keys::RecordKey;
pub use model::UserRecord;
pub use rewards::{RewardDescriptor, RewardOutcome};
pub use service::{ConnectionStatus, SyncService};
pub use types::{Result, SyncError};
