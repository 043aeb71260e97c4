//! End-to-end tests for the optimistic update protocol and the reward
//! ledger, run against the in-memory reference store:
//! - the full claim/duplicate/debit scenario
//! - idempotence under concurrent duplicate deliveries
//! - per-key serialization (no lost updates)
//! - rollback to the exact prior snapshot on store failure and timeout

use std::sync::Arc;
use std::time::Duration;

use tokio_test::assert_ok;

use coinsync::events::{PaymentNotice, PaymentStatus};
use coinsync::model::ReferralEdge;
use coinsync::store::{MemoryStore, RecordStore};
use coinsync::{RewardDescriptor, RewardOutcome, SyncConfig, SyncError, SyncService};

const USER: &str = "123456789";

fn service_with_store() -> (Arc<MemoryStore>, SyncService) {
    let store = Arc::new(MemoryStore::new());
    let service = SyncService::new(store.clone(), SyncConfig::default());
    (store, service)
}

async fn seed_balance(service: &SyncService, external_id: &str, balance: i64) {
    tokio_test::assert_ok!(
        service
            .update_user(external_id, |current| Ok(current.credited(balance)))
            .await
    );
}

// =============================================================================
// Claim, duplicate claim, over-debit, debit
// =============================================================================

#[tokio::test]
async fn claim_duplicate_and_debit_scenario() {
    let (_store, service) = service_with_store();
    seed_balance(&service, USER, 1000).await;

    // (a) First claim credits
    let outcome = service
        .apply_reward(USER, "claim-1", &RewardDescriptor::TaskClaim { amount: 120 })
        .await
        .unwrap();
    let record = match outcome {
        RewardOutcome::Applied(record) => record,
        other => panic!("expected Applied, got {other:?}"),
    };
    assert_eq!(record.balance, 1120);
    assert!(record.applied_event_ids.contains("claim-1"));

    // (b) Redelivery is a successful no-op
    let outcome = service
        .apply_reward(USER, "claim-1", &RewardDescriptor::TaskClaim { amount: 120 })
        .await
        .unwrap();
    assert_eq!(outcome, RewardOutcome::AlreadyApplied);
    assert_eq!(service.get_user(USER).await.unwrap().balance, 1120);

    // (c) Over-debit is rejected before anything is written
    let err = service
        .update_user(USER, |current| Ok(current.debited(2000)))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::InvariantViolation(_)));
    assert_eq!(service.get_user(USER).await.unwrap().balance, 1120);

    // (d) Affordable debit goes through
    let record = service
        .update_user(USER, |current| Ok(current.debited(100)))
        .await
        .unwrap();
    assert_eq!(record.balance, 1020);
}

// =============================================================================
// Idempotence
// =============================================================================

#[tokio::test]
async fn concurrent_duplicate_deliveries_credit_once() {
    let (_store, service) = service_with_store();
    let service = Arc::new(service);
    seed_balance(&service, USER, 1000).await;

    let mut handles = Vec::new();
    for _ in 0..6 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            service
                .apply_reward(USER, "evt-dup", &RewardDescriptor::TaskClaim { amount: 120 })
                .await
                .unwrap()
        }));
    }

    let mut applied = 0;
    let mut duplicates = 0;
    for handle in handles {
        match handle.await.unwrap() {
            RewardOutcome::Applied(_) => applied += 1,
            RewardOutcome::AlreadyApplied => duplicates += 1,
        }
    }

    assert_eq!(applied, 1);
    assert_eq!(duplicates, 5);

    let record = service.get_user(USER).await.unwrap();
    assert_eq!(record.balance, 1120);
    assert_eq!(
        record
            .applied_event_ids
            .iter()
            .filter(|id| *id == "evt-dup")
            .count(),
        1
    );
}

#[tokio::test]
async fn distinct_events_on_one_key_both_apply() {
    let (_store, service) = service_with_store();
    let service = Arc::new(service);
    seed_balance(&service, USER, 1000).await;

    let a = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .apply_reward(USER, "evt-a", &RewardDescriptor::TaskClaim { amount: 100 })
                .await
                .unwrap()
        })
    };
    let b = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .apply_reward(USER, "evt-b", &RewardDescriptor::TaskClaim { amount: 50 })
                .await
                .unwrap()
        })
    };
    assert!(matches!(a.await.unwrap(), RewardOutcome::Applied(_)));
    assert!(matches!(b.await.unwrap(), RewardOutcome::Applied(_)));

    // No lost update: both increments landed
    assert_eq!(service.get_user(USER).await.unwrap().balance, 1150);
}

#[tokio::test]
async fn serialized_updates_never_lose_increments() {
    let (_store, service) = service_with_store();
    let service = Arc::new(service);
    seed_balance(&service, USER, 0).await;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            service
                .update_user(USER, |current| Ok(current.credited(1)))
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(service.get_user(USER).await.unwrap().balance, 10);
}

// =============================================================================
// Rollback
// =============================================================================

#[tokio::test]
async fn failed_write_rolls_back_to_exact_prior_value() {
    let (store, service) = service_with_store();
    seed_balance(&service, USER, 100).await;

    store.fail_next_writes(1);
    let err = service
        .update_user(USER, |current| Ok(current.credited(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Unavailable(_)));

    // Not 0, not 150: exactly the prior snapshot
    assert_eq!(service.get_user(USER).await.unwrap().balance, 100);
    let key = coinsync::RecordKey::resolve(USER).unwrap();
    assert_eq!(store.read(&key).await.unwrap().balance, 100);
}

#[tokio::test]
async fn failed_reward_write_is_retryable() {
    let (store, service) = service_with_store();
    seed_balance(&service, USER, 100).await;

    store.fail_next_writes(1);
    let err = service
        .apply_reward(USER, "evt-retry", &RewardDescriptor::TaskClaim { amount: 40 })
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Unavailable(_)));

    // The tentative ledger insert was rolled back with the snapshot
    let record = service.get_user(USER).await.unwrap();
    assert!(!record.applied_event_ids.contains("evt-retry"));
    assert_eq!(record.balance, 100);

    // So the retry applies normally
    let outcome = service
        .apply_reward(USER, "evt-retry", &RewardDescriptor::TaskClaim { amount: 40 })
        .await
        .unwrap();
    assert!(matches!(outcome, RewardOutcome::Applied(_)));
    assert_eq!(service.get_user(USER).await.unwrap().balance, 140);
}

#[tokio::test]
async fn slow_write_times_out_and_rolls_back() {
    let store = Arc::new(MemoryStore::new());
    let config = SyncConfig::default().with_write_timeout(Duration::from_millis(50));
    let service = SyncService::new(store.clone(), config);
    seed_balance(&service, USER, 100).await;

    store.delay_writes(Some(Duration::from_millis(500)));
    let err = service
        .update_user(USER, |current| Ok(current.credited(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Timeout(_)));

    store.delay_writes(None);
    assert_eq!(service.get_user(USER).await.unwrap().balance, 100);
}

#[tokio::test]
async fn failed_creation_leaves_no_phantom_record() {
    let (store, service) = service_with_store();

    store.fail_next_writes(1);
    let err = service
        .update_user(USER, |current| Ok(current.credited(10)))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Unavailable(_)));

    // The record never existed upstream and must not exist locally either
    let err = service.get_user(USER).await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));
}

// =============================================================================
// Key validation
// =============================================================================

#[tokio::test]
async fn synthetic_ids_never_reach_the_store() {
    let (_store, service) = service_with_store();

    for id in ["", "anon-12345", "1234", "not-a-number"] {
        let err = service.get_user(id).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidKey(_)), "{id}");
        let err = service
            .apply_reward(id, "evt", &RewardDescriptor::TaskClaim { amount: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidKey(_)), "{id}");
    }
}

// =============================================================================
// Webhooks and referrals
// =============================================================================

#[tokio::test]
async fn payment_webhook_redelivery_credits_once() {
    let (_store, service) = service_with_store();
    seed_balance(&service, USER, 0).await;

    let notice = PaymentNotice {
        invoice_id: "inv-1".to_string(),
        user_id: USER.to_string(),
        amount: 500,
        status: PaymentStatus::Paid,
        transaction_id: Some("txn-1".to_string()),
    };

    let first = service.handle_payment(&notice).await.unwrap();
    assert!(matches!(first, Some(RewardOutcome::Applied(_))));

    let second = service.handle_payment(&notice).await.unwrap();
    assert_eq!(second, Some(RewardOutcome::AlreadyApplied));

    assert_eq!(service.get_user(USER).await.unwrap().balance, 500);
}

#[tokio::test]
async fn pending_payments_do_not_credit() {
    let (_store, service) = service_with_store();
    seed_balance(&service, USER, 0).await;

    let notice = PaymentNotice {
        invoice_id: "inv-2".to_string(),
        user_id: USER.to_string(),
        amount: 500,
        status: PaymentStatus::Pending,
        transaction_id: None,
    };
    assert_eq!(service.handle_payment(&notice).await.unwrap(), None);
    assert_eq!(service.get_user(USER).await.unwrap().balance, 0);
}

#[tokio::test]
async fn referral_confirmation_pays_the_referrer_once() {
    let (_store, service) = service_with_store();
    let referrer = "222222222";
    seed_balance(&service, referrer, 0).await;

    let mut edge = ReferralEdge::new("111111111", referrer);

    let first = service.confirm_referral(&mut edge, 200).await.unwrap();
    let record = match first {
        RewardOutcome::Applied(record) => record,
        other => panic!("expected Applied, got {other:?}"),
    };
    assert_eq!(record.balance, 200);
    assert_eq!(record.referral_count, 1);
    assert_eq!(record.referral_earnings, 200);

    // Re-confirming the same edge is suppressed by the ledger
    let second = service.confirm_referral(&mut edge, 200).await.unwrap();
    assert_eq!(second, RewardOutcome::AlreadyApplied);
    assert_eq!(service.get_user(referrer).await.unwrap().balance, 200);
}

// =============================================================================
// Farming
// =============================================================================

#[tokio::test]
async fn farming_cannot_start_twice() {
    let (_store, service) = service_with_store();
    seed_balance(&service, USER, 0).await;

    service.start_farming(USER).await.unwrap();
    let err = service.start_farming(USER).await.unwrap_err();
    assert!(matches!(err, SyncError::InvariantViolation(_)));
}

#[tokio::test]
async fn farming_claim_requires_a_complete_window() {
    let (_store, service) = service_with_store();
    seed_balance(&service, USER, 0).await;

    // No window at all
    let err = service.claim_farming(USER).await.unwrap_err();
    assert!(matches!(err, SyncError::InvariantViolation(_)));

    // Window still running
    service.start_farming(USER).await.unwrap();
    let err = service.claim_farming(USER).await.unwrap_err();
    assert!(matches!(err, SyncError::InvariantViolation(_)));
}

#[tokio::test]
async fn daily_check_in_is_once_per_day() {
    let (_store, service) = service_with_store();
    seed_balance(&service, USER, 0).await;

    let first = service.daily_check_in(USER).await.unwrap();
    let record = match first {
        RewardOutcome::Applied(record) => record,
        other => panic!("expected Applied, got {other:?}"),
    };
    assert_eq!(record.daily_streak, 1);
    let balance = record.balance;

    let second = service.daily_check_in(USER).await.unwrap();
    assert_eq!(second, RewardOutcome::AlreadyApplied);
    assert_eq!(service.get_user(USER).await.unwrap().balance, balance);
}
