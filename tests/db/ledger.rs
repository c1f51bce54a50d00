use creditgate::error::AppError;
use rusqlite::Connection;

use super::common::*;

#[test]
fn signup_bonus_is_a_ledger_entry() {
    let conn = setup_test_db();
    let account = create_test_account(&conn, "a@example.com", 10);

    assert_eq!(account.credits_balance, 10);
    let ledger = queries::list_ledger_entries(&conn, &account.id, 10).unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].reason, LedgerReason::SignupBonus);
    assert_eq!(ledger[0].balance_after, 10);
}

#[test]
fn zero_signup_credits_writes_no_entry() {
    let conn = setup_test_db();
    let account = create_test_account(&conn, "a@example.com", 0);

    assert!(queries::list_ledger_entries(&conn, &account.id, 10).unwrap().is_empty());
}

#[test]
fn email_lookup_is_case_insensitive() {
    let conn = setup_test_db();
    let account = create_test_account(&conn, "Mixed@Example.COM", 0);

    assert_eq!(account.email, "mixed@example.com");
    let found = queries::get_account_by_email(&conn, " MIXED@example.com ").unwrap().unwrap();
    assert_eq!(found.id, account.id);
}

#[test]
fn duplicate_email_is_a_conflict() {
    let conn = setup_test_db();
    create_test_account(&conn, "a@example.com", 0);

    let result = queries::create_account(&conn, &CreateAccount { email: "A@example.com".into() }, 0);
    assert!(matches!(result, Err(AppError::Conflict(_))));
}

#[test]
fn debit_below_zero_is_refused_without_writing() {
    let conn = setup_test_db();
    let account = create_test_account(&conn, "a@example.com", 10);

    let result = queries::apply_credit_delta(&conn, &account.id, -11, LedgerReason::TaskCharge, None, None);

    match result {
        Err(AppError::InsufficientCredits { balance, required }) => {
            assert_eq!(balance, 10);
            assert_eq!(required, 11);
        }
        other => panic!("expected InsufficientCredits, got {:?}", other),
    }
    assert_eq!(balance(&conn, &account.id), 10);
    assert_eq!(queries::list_ledger_entries(&conn, &account.id, 10).unwrap().len(), 1);
}

#[test]
fn debit_to_exactly_zero_is_allowed() {
    let conn = setup_test_db();
    let account = create_test_account(&conn, "a@example.com", 10);

    let entry = queries::apply_credit_delta(&conn, &account.id, -10, LedgerReason::TaskCharge, None, None).unwrap();

    assert_eq!(entry.balance_after, 0);
}

#[test]
fn delta_on_unknown_account_is_not_found() {
    let conn = setup_test_db();

    let result = queries::apply_credit_delta(&conn, "acc_missing", 5, LedgerReason::Adjustment, None, None);

    assert!(matches!(result, Err(AppError::NotFound(_))));
}

#[test]
fn balance_tracks_ledger_sum() {
    let conn = setup_test_db();
    let account = create_test_account(&conn, "a@example.com", 10);

    for (delta, reason) in [
        (100, LedgerReason::Purchase),
        (-30, LedgerReason::TaskCharge),
        (30, LedgerReason::TaskRefund),
        (-45, LedgerReason::Refund),
    ] {
        queries::apply_credit_delta(&conn, &account.id, delta, reason, None, None).unwrap();
    }

    assert_eq!(balance(&conn, &account.id), 65);
    assert_ledger_consistent(&conn, &account.id);
}

#[test]
fn ledger_entries_keep_event_provenance() {
    let conn = setup_test_db();
    let account = create_test_account(&conn, "a@example.com", 0);

    queries::apply_credit_delta(&conn, &account.id, 100, LedgerReason::Purchase, Some("Starter"), Some("evt_9")).unwrap();

    let entries = ledger_entries_for_event(&conn, "evt_9");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].note.as_deref(), Some("Starter"));
    assert_eq!(entries[0].account_id, account.id);
}

#[test]
fn corrupt_reason_column_is_an_error_not_a_panic() {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(
        "CREATE TABLE ledger_entries (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            delta INTEGER NOT NULL,
            balance_after INTEGER NOT NULL,
            reason TEXT NOT NULL,  -- No CHECK constraint!
            note TEXT,
            event_id TEXT,
            created_at INTEGER NOT NULL
        );
        INSERT INTO ledger_entries VALUES ('le_1', 'acc_1', 5, 5, 'bogus_reason', NULL, 'evt_1', 0);",
    )
    .unwrap();

    let result = queries::list_ledger_entries(&conn, "acc_1", 10);

    assert!(result.is_err(), "invalid enum value should surface as an error");
}
