//! Session restoration: retry budget, backoff pacing, expiry, and the
//! live-session short circuit.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio::time::{Duration, Instant};

use common::{memory_store, user, FakeAuthClient, FakeDirectory};
use promptmarket_api::handlers::AppServices;
use promptmarket_api::recovery::restore::RestoreOutcome;
use promptmarket_api::recovery::{keys, SessionBackup};
use promptmarket_api::storage::RedundantStore;

const ORDER: &str = "5O190127TN364715T";

async fn seed_backup(store: &RedundantStore, age_minutes: i64) {
    let backup = SessionBackup {
        access_token: "stashed-access".into(),
        refresh_token: "stashed-refresh".into(),
        user_id: "user-1".into(),
        timestamp: Utc::now() - ChronoDuration::minutes(age_minutes),
    };
    store
        .put_both(
            &keys::session_backup(ORDER),
            &serde_json::to_string(&backup).unwrap(),
        )
        .await
        .unwrap();
}

fn services_with(auth: Arc<FakeAuthClient>, store: Arc<RedundantStore>) -> AppServices {
    AppServices::new(store, auth, Arc::new(FakeDirectory::default()))
}

#[tokio::test(start_paused = true)]
async fn restore_succeeds_after_two_failed_attempts_with_backoff() {
    let store = memory_store();
    seed_backup(&store, 5).await;
    let auth = Arc::new(FakeAuthClient::restorable_after(2, user("user-1")));
    let services = services_with(auth.clone(), store.clone());

    let started = Instant::now();
    let outcome = services.restorer.restore(ORDER, None).await;

    // Two failed attempts sleep 2s and 4s; the third succeeds immediately.
    assert_eq!(started.elapsed(), Duration::from_secs(6));
    assert_eq!(auth.set_session_call_count(), 3);
    match outcome {
        RestoreOutcome::Restored { session, .. } => {
            assert_eq!(session.user.id, "user-1");
        }
        other => panic!("expected restored session, got {:?}", other),
    }

    // Success resets the counter and clears the backup.
    assert!(!store.contains(&keys::session_backup(ORDER)).await);
    assert!(!store.contains(&keys::restore_attempts(ORDER)).await);
}

#[tokio::test(start_paused = true)]
async fn expired_backup_is_discarded_without_contacting_auth() {
    let store = memory_store();
    seed_backup(&store, 61).await;
    let auth = Arc::new(FakeAuthClient::restorable(user("user-1")));
    let services = services_with(auth.clone(), store.clone());

    let outcome = services.restorer.restore(ORDER, None).await;

    assert!(matches!(outcome, RestoreOutcome::Failed));
    assert_eq!(auth.set_session_call_count(), 0);
    assert!(!store.contains(&keys::session_backup(ORDER)).await);
}

#[tokio::test(start_paused = true)]
async fn backup_just_inside_the_ttl_is_still_usable() {
    let store = memory_store();
    seed_backup(&store, 59).await;
    let auth = Arc::new(FakeAuthClient::restorable(user("user-1")));
    let services = services_with(auth.clone(), store.clone());

    let outcome = services.restorer.restore(ORDER, None).await;
    assert!(outcome.is_success());
    assert_eq!(auth.set_session_call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn attempt_budget_is_exhausted_after_five_tries() {
    let store = memory_store();
    seed_backup(&store, 5).await;
    let auth = Arc::new(FakeAuthClient::never_restores());
    let services = services_with(auth.clone(), store.clone());

    let started = Instant::now();
    let outcome = services.restorer.restore(ORDER, None).await;

    assert!(matches!(outcome, RestoreOutcome::Failed));
    assert_eq!(auth.set_session_call_count(), 5);
    // Backoff after every failed attempt: 2 + 4 + 8 + 16 + 32 seconds.
    assert_eq!(started.elapsed(), Duration::from_secs(62));
    // The counter survives non-forced cleanup so later callbacks see it.
    assert!(store.contains(&keys::restore_attempts(ORDER)).await);
}

#[tokio::test(start_paused = true)]
async fn exhausted_budget_forces_cleanup_on_the_next_pass() {
    let store = memory_store();
    seed_backup(&store, 5).await;
    store
        .put_both(&keys::restore_attempts(ORDER), "5")
        .await
        .unwrap();
    store
        .put_both(&format!("paypal_payment_data:{}", ORDER), "{}")
        .await
        .unwrap();
    let auth = Arc::new(FakeAuthClient::restorable(user("user-1")));
    let services = services_with(auth.clone(), store.clone());

    let outcome = services.restorer.restore(ORDER, None).await;

    // No further attempts are spent once the budget is gone.
    assert!(matches!(outcome, RestoreOutcome::Failed));
    assert_eq!(auth.set_session_call_count(), 0);
    // Forced cleanup removes the counter and sweeps provider-named keys.
    assert!(!store.contains(&keys::restore_attempts(ORDER)).await);
    assert!(
        !store
            .contains(&format!("paypal_payment_data:{}", ORDER))
            .await
    );
}

#[tokio::test(start_paused = true)]
async fn live_session_short_circuits_restoration() {
    let store = memory_store();
    seed_backup(&store, 5).await;
    let auth = Arc::new(FakeAuthClient::live(user("user-1")));
    let services = services_with(auth.clone(), store.clone());

    let outcome = services.restorer.restore(ORDER, Some("still-valid")).await;

    match outcome {
        RestoreOutcome::AlreadyLive(live) => assert_eq!(live.id, "user-1"),
        other => panic!("expected live session, got {:?}", other),
    }
    assert_eq!(auth.set_session_call_count(), 0);
    // The backup is redundant once the session is confirmed live.
    assert!(!store.contains(&keys::session_backup(ORDER)).await);
}

#[tokio::test(start_paused = true)]
async fn missing_backup_fails_without_touching_other_records() {
    let store = memory_store();
    store
        .put_both(&keys::fallback_data(ORDER), r#"{"user_id":"user-1","plan_id":"plan-pro","order_id":"5O190127TN364715T","timestamp":"2026-08-25T00:00:00Z"}"#)
        .await
        .unwrap();
    let auth = Arc::new(FakeAuthClient::restorable(user("user-1")));
    let services = services_with(auth.clone(), store.clone());

    let outcome = services.restorer.restore(ORDER, None).await;

    assert!(matches!(outcome, RestoreOutcome::Failed));
    assert_eq!(auth.set_session_call_count(), 0);
    // The fallback record must survive for the degraded recovery path.
    assert!(store.contains(&keys::fallback_data(ORDER)).await);
}
