//! PostgreSQL Call Store Integration Tests
#![cfg(feature = "postgres")]

use coach_call::application::ProfileResolver;
use coach_call::config::DatabaseConfig;
use coach_call::domain::call::{
    CallStore, CallerType, ChangeFeed, EndReason, NewCallRecord, NewSignal, RecordPatch,
    RecordStatus, SignalPayload,
};
use coach_call::domain::shared::{CallId, DomainError, UserId};
use coach_call::infrastructure::persistence::{create_pool, run_migrations, PgCallStore, PgChangeFeed};
use sqlx::PgPool;
use std::time::Duration;

const RINGING_WINDOW: Duration = Duration::from_secs(50);

#[tokio::test]
#[ignore] // Requires database
async fn test_record_lifecycle() {
    let pool = setup_database().await;
    let store = PgCallStore::new(pool.clone(), RINGING_WINDOW);
    let (caller, callee) = (UserId::new(), UserId::new());

    let record = store
        .create_call_record(new_call(caller, callee))
        .await
        .expect("Failed to create call record");
    assert_eq!(record.status, RecordStatus::Ringing);
    assert_eq!(record.caller_type, CallerType::Coach);

    let connected = store
        .update_call_record(record.id, RecordPatch::Connected)
        .await
        .expect("Failed to mark connected");
    assert_eq!(connected.status, RecordStatus::Connected);
    assert!(connected.connected_at.is_some());

    let ended = store
        .update_call_record(
            record.id,
            RecordPatch::Ended {
                reason: EndReason::UserHangup,
                duration_seconds: 42,
            },
        )
        .await
        .expect("Failed to end call");
    assert_eq!(ended.status, RecordStatus::Ended);
    assert_eq!(ended.duration_seconds, Some(42));
    assert!(ended.timestamps_ordered());

    // A second end is a no-op
    let again = store
        .update_call_record(
            record.id,
            RecordPatch::Ended {
                reason: EndReason::RemoteHangup,
                duration_seconds: 50,
            },
        )
        .await
        .expect("Failed to re-apply end");
    assert_eq!(again.end_reason, Some(EndReason::UserHangup));

    let rated = store
        .update_call_record(record.id, RecordPatch::Rated { rating: 4 })
        .await
        .expect("Failed to rate call");
    assert_eq!(rated.quality_rating, Some(4));

    cleanup_database(pool, &[caller, callee]).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_open_call_blocks_same_pair() {
    let pool = setup_database().await;
    let store = PgCallStore::new(pool.clone(), RINGING_WINDOW);
    let (a, b, c) = (UserId::new(), UserId::new(), UserId::new());

    store.create_call_record(new_call(a, b)).await.unwrap();

    let err = store.create_call_record(new_call(b, a)).await.unwrap_err();
    assert!(matches!(err, DomainError::Conflict(_)));

    // Other pairs are unaffected
    store.create_call_record(new_call(c, b)).await.unwrap();

    cleanup_database(pool, &[a, b, c]).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_signals_are_ordered_per_recipient() {
    let pool = setup_database().await;
    let store = PgCallStore::new(pool.clone(), RINGING_WINDOW);
    let (caller, callee) = (UserId::new(), UserId::new());
    let record = store.create_call_record(new_call(caller, callee)).await.unwrap();

    for payload in [SignalPayload::Hangup, SignalPayload::Reject { reason: None }] {
        store
            .append_signaling_message(NewSignal {
                call_id: record.id,
                from_user_id: caller,
                to_user_id: callee,
                payload,
            })
            .await
            .expect("Failed to append signal");
    }

    let signals = store.signals_for(record.id, callee).await.unwrap();
    assert_eq!(signals.len(), 2);
    assert_eq!(signals[0].signal_type, "hangup");
    assert_eq!(signals[1].signal_type, "reject");
    assert!(store.signals_for(record.id, caller).await.unwrap().is_empty());

    let err = store
        .append_signaling_message(NewSignal {
            call_id: CallId::new(),
            from_user_id: caller,
            to_user_id: callee,
            payload: SignalPayload::Hangup,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::Storage(_)));

    cleanup_database(pool, &[caller, callee]).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_change_feed_delivers_rows() {
    let pool = setup_database().await;
    let store = PgCallStore::new(pool.clone(), RINGING_WINDOW);
    let feed = PgChangeFeed::new(store.clone());
    let (caller, callee) = (UserId::new(), UserId::new());

    let mut inserts = feed.watch_call_inserts(callee).await.unwrap();
    let mut signals = feed.watch_signals(callee).await.unwrap();

    let record = store.create_call_record(new_call(caller, callee)).await.unwrap();
    let inserted = tokio::time::timeout(Duration::from_secs(5), inserts.recv())
        .await
        .expect("No insert notification")
        .unwrap();
    assert_eq!(inserted.id, record.id);

    store
        .append_signaling_message(NewSignal {
            call_id: record.id,
            from_user_id: caller,
            to_user_id: callee,
            payload: SignalPayload::Hangup,
        })
        .await
        .unwrap();
    let signal = tokio::time::timeout(Duration::from_secs(5), signals.recv())
        .await
        .expect("No signal notification")
        .unwrap();
    assert_eq!(signal.call_id, record.id);
    assert_eq!(signal.to_user_id, callee);

    cleanup_database(pool, &[caller, callee]).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_profile_lookup() {
    let pool = setup_database().await;
    let store = PgCallStore::new(pool.clone(), RINGING_WINDOW);
    let user = UserId::new();

    sqlx::query("INSERT INTO profiles (id, display_name) VALUES ($1, $2)")
        .bind(user.as_uuid())
        .bind("Coach Lin")
        .execute(&pool)
        .await
        .unwrap();

    let profile = store.resolve(user).await.unwrap();
    assert_eq!(profile.display_name, "Coach Lin");
    assert!(profile.avatar_url.is_none());

    let missing = store.resolve(UserId::new()).await.unwrap_err();
    assert!(matches!(missing, DomainError::NotFound(_)));

    sqlx::query("DELETE FROM profiles WHERE id = $1")
        .bind(user.as_uuid())
        .execute(&pool)
        .await
        .ok();
    pool.close().await;
}

// Helper functions

fn new_call(caller: UserId, callee: UserId) -> NewCallRecord {
    NewCallRecord {
        caller_id: caller,
        callee_id: callee,
        caller_type: CallerType::Coach,
        appointment_id: None,
    }
}

async fn setup_database() -> PgPool {
    let config = DatabaseConfig {
        url: std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://postgres@localhost/coach_call_test".to_string()),
        max_connections: 5,
        min_connections: 1,
        ..DatabaseConfig::default()
    };

    let pool = create_pool(&config).await.expect("Failed to create pool");
    run_migrations(&pool).await.expect("Failed to run migrations");
    pool
}

async fn cleanup_database(pool: PgPool, users: &[UserId]) {
    let ids: Vec<_> = users.iter().map(|u| u.as_uuid()).collect();
    sqlx::query(
        "DELETE FROM coach_call_signals WHERE call_id IN \
         (SELECT id FROM coach_calls WHERE caller_id = ANY($1) OR callee_id = ANY($1))",
    )
    .bind(&ids)
    .execute(&pool)
    .await
    .ok();
    sqlx::query("DELETE FROM coach_calls WHERE caller_id = ANY($1) OR callee_id = ANY($1)")
        .bind(&ids)
        .execute(&pool)
        .await
        .ok();
    pool.close().await;
}
