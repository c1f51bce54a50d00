use axum::http::StatusCode;

use creditgate::db::create_pool;
use creditgate::error::AppError;
use creditgate::handlers::webhooks::common::{GateOutcome, Settlement, settle_once};

use super::common::*;

fn seed_purchase_fixtures(state: &AppState) -> Account {
    let conn = state.db.get().unwrap();
    create_test_product(&conn, "prod_starter", 100, ProductKind::OneTime);
    create_test_account(&conn, "buyer@example.com", 0)
}

#[tokio::test]
async fn duplicate_delivery_credits_once() {
    let state = create_test_app_state();
    let account = seed_purchase_fixtures(&state);
    let payload = checkout_completed("evt_dup", "ord_1", "prod_starter", &account.id, 1900);

    let (status, body) = send(&state, creem_request(&payload)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK");

    for _ in 0..3 {
        let (status, body) = send(&state, creem_request(&payload)).await;
        assert_eq!(status, StatusCode::OK, "redelivery must be acknowledged");
        assert_eq!(body, b"Already processed");
    }

    let conn = state.db.get().unwrap();
    assert_eq!(balance(&conn, &account.id), 100);
    assert_eq!(ledger_entries_for_event(&conn, "evt_dup").len(), 1);
    assert_eq!(orders_for_account(&conn, &account.id).len(), 1);
    assert_ledger_consistent(&conn, &account.id);
}

#[tokio::test]
async fn applied_event_records_outcome_and_entity() {
    let state = create_test_app_state();
    let account = seed_purchase_fixtures(&state);

    send(&state, creem_request(&checkout_completed("evt_1", "ord_1", "prod_starter", &account.id, 1900))).await;

    let conn = state.db.get().unwrap();
    let record = queries::get_webhook_event(&conn, "creem", "evt_1").unwrap().unwrap();
    let order = queries::get_order_by_provider_order(&conn, "creem", "ord_1").unwrap().unwrap();
    assert_eq!(record.outcome, EventOutcome::Applied);
    assert_eq!(record.event_type, "checkout.completed");
    assert_eq!(record.entity_id.as_deref(), Some(order.id.as_str()));
    assert!(record.payload.contains("ord_1"));
}

#[tokio::test]
async fn same_order_under_new_event_id_is_not_credited_twice() {
    let state = create_test_app_state();
    let account = seed_purchase_fixtures(&state);

    send(&state, creem_request(&checkout_completed("evt_a", "ord_1", "prod_starter", &account.id, 1900))).await;
    let (status, body) =
        send(&state, creem_request(&checkout_completed("evt_b", "ord_1", "prod_starter", &account.id, 1900))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"Order already settled");

    let conn = state.db.get().unwrap();
    assert_eq!(balance(&conn, &account.id), 100);
    let record = queries::get_webhook_event(&conn, "creem", "evt_b").unwrap().unwrap();
    assert_eq!(record.outcome, EventOutcome::Skipped);
}

#[tokio::test]
async fn skipped_event_stays_claimed() {
    let state = create_test_app_state();
    let account = {
        let conn = state.db.get().unwrap();
        create_test_account(&conn, "buyer@example.com", 0)
    };
    let payload = checkout_completed("evt_unknown_product", "ord_1", "prod_missing", &account.id, 1900);

    let (status, body) = send(&state, creem_request(&payload)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"Product not found");

    let (_, body) = send(&state, creem_request(&payload)).await;
    assert_eq!(body, b"Already processed");

    let conn = state.db.get().unwrap();
    assert_eq!(balance(&conn, &account.id), 0);
}

#[test]
fn failed_settlement_releases_claim_for_retry() {
    let mut conn = setup_test_db();
    let account = create_test_account(&conn, "buyer@example.com", 0);

    // Balance written, then the settlement fails part-way
    let result = settle_once(&mut conn, "creem", "evt_retry", "checkout.completed", "{}", |tx| {
        queries::apply_credit_delta(tx, &account.id, 100, LedgerReason::Purchase, None, Some("evt_retry"))?;
        Err(AppError::Internal("simulated crash".into()))
    });
    assert!(result.is_err());

    assert_eq!(balance(&conn, &account.id), 0, "partial writes must roll back");
    assert!(
        queries::get_webhook_event(&conn, "creem", "evt_retry").unwrap().is_none(),
        "claim must roll back with the settlement"
    );

    // The provider's retry is processed from scratch
    let outcome = settle_once(&mut conn, "creem", "evt_retry", "checkout.completed", "{}", |tx| {
        queries::apply_credit_delta(tx, &account.id, 100, LedgerReason::Purchase, None, Some("evt_retry"))?;
        Ok(Settlement::Applied { entity_id: "ord_1".into() })
    })
    .unwrap();

    assert_eq!(
        outcome,
        GateOutcome::Settled(Settlement::Applied { entity_id: "ord_1".into() })
    );
    assert_eq!(balance(&conn, &account.id), 100);
    assert_ledger_consistent(&conn, &account.id);
}

#[test]
fn gate_does_not_run_settlement_for_recorded_event() {
    let mut conn = setup_test_db();

    let first = settle_once(&mut conn, "creem", "evt_1", "checkout.completed", "{}", |_| {
        Ok(Settlement::Skipped("nothing to do"))
    })
    .unwrap();
    assert_eq!(first, GateOutcome::Settled(Settlement::Skipped("nothing to do")));

    let second = settle_once(&mut conn, "creem", "evt_1", "checkout.completed", "{}", |_| {
        panic!("settlement must not run for a recorded event")
    })
    .unwrap();
    assert_eq!(second, GateOutcome::AlreadyProcessed);
}

#[test]
fn event_ids_are_scoped_per_provider() {
    let mut conn = setup_test_db();

    let creem = settle_once(&mut conn, "creem", "evt_1", "a", "{}", |_| Ok(Settlement::Skipped("x"))).unwrap();
    let wavespeed =
        settle_once(&mut conn, "wavespeed", "evt_1", "a", "{}", |_| Ok(Settlement::Skipped("x"))).unwrap();

    assert!(matches!(creem, GateOutcome::Settled(_)));
    assert!(matches!(wavespeed, GateOutcome::Settled(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicate_deliveries_credit_once() {
    let path = std::env::temp_dir().join(format!("creditgate-test-{}.db", uuid::Uuid::new_v4()));
    let path = path.to_string_lossy().to_string();

    let pool = create_pool(&path).unwrap();
    {
        let conn = pool.get().unwrap();
        init_db(&conn).unwrap();
    }
    let state = create_test_app_state_with_pool(pool, UNREACHABLE_WAVESPEED_URL);
    let account = seed_purchase_fixtures(&state);
    let payload = checkout_completed("evt_race", "ord_race", "prod_starter", &account.id, 1900);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let state = state.clone();
        let payload = payload.clone();
        handles.push(tokio::spawn(async move { send(&state, creem_request(&payload)).await }));
    }

    let mut applied = 0;
    for handle in handles {
        let (status, body) = handle.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        if body == b"OK" {
            applied += 1;
        } else {
            assert_eq!(body, b"Already processed");
        }
    }
    assert_eq!(applied, 1, "exactly one delivery should settle");

    {
        let conn = state.db.get().unwrap();
        assert_eq!(balance(&conn, &account.id), 100);
        assert_ledger_consistent(&conn, &account.id);
    }

    drop(state);
    let _ = std::fs::remove_file(&path);
    let _ = std::fs::remove_file(format!("{}-wal", path));
    let _ = std::fs::remove_file(format!("{}-shm", path));
}
