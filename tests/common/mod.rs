//! Test utilities and fixtures for creditgate integration tests

#![allow(dead_code)]

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
    routing::post,
};
use hmac::{Hmac, Mac};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use serde_json::{Value, json};
use sha2::Sha256;
use tower::ServiceExt;

pub use creditgate::db::{AppState, DbPool, init_db, queries};
pub use creditgate::generation::WaveSpeedClient;
pub use creditgate::handlers;
pub use creditgate::models::*;
pub use creditgate::payments::CreemClient;

type HmacSha256 = Hmac<Sha256>;

pub const CREEM_SECRET: &str = "creem_whsec_test";
pub const WAVESPEED_SECRET: &str = "wavespeed_whsec_test";
pub const API_TOKEN: &str = "test-token";

/// Nothing listens here, so submissions fail fast with a connection error
pub const UNREACHABLE_WAVESPEED_URL: &str = "http://127.0.0.1:1/api/v3";

pub const TEST_MODEL: &str = "wavespeed-ai/wan-2.1/t2v-480p";

/// Create an in-memory test database with schema initialized
pub fn setup_test_db() -> Connection {
    let conn = Connection::open_in_memory().expect("Failed to create in-memory database");
    init_db(&conn).expect("Failed to initialize schema");
    conn
}

/// In-memory pool. Every in-memory connection is its own database, so the
/// pool holds exactly one; drop test connections before sending requests.
pub fn setup_test_pool() -> DbPool {
    let manager = SqliteConnectionManager::memory();
    let pool = Pool::builder().max_size(1).build(manager).unwrap();
    {
        let conn = pool.get().unwrap();
        init_db(&conn).unwrap();
    }
    pool
}

pub fn create_test_app_state_with_pool(pool: DbPool, wavespeed_url: &str) -> AppState {
    AppState {
        db: pool,
        base_url: "http://localhost:3000".to_string(),
        api_token: API_TOKEN.to_string(),
        signup_credits: 10,
        creem: CreemClient::new(CREEM_SECRET),
        wavespeed: WaveSpeedClient::new(
            reqwest::Client::new(),
            "ws_test_key",
            wavespeed_url,
            WAVESPEED_SECRET,
        ),
    }
}

/// Create an AppState for testing with an in-memory database
pub fn create_test_app_state() -> AppState {
    create_test_app_state_with_pool(setup_test_pool(), UNREACHABLE_WAVESPEED_URL)
}

pub fn create_test_app_state_with_wavespeed(url: &str) -> AppState {
    create_test_app_state_with_pool(setup_test_pool(), url)
}

/// The full router, as served
pub fn app(state: AppState) -> Router {
    handlers::app(state)
}

// ============ Fixtures ============

/// Create an account with a given starting balance
pub fn create_test_account(conn: &Connection, email: &str, credits: i64) -> Account {
    queries::create_account(
        conn,
        &CreateAccount {
            email: email.to_string(),
        },
        credits,
    )
    .expect("Failed to create test account")
}

pub fn create_test_product(conn: &Connection, id: &str, credits: i64, kind: ProductKind) -> Product {
    queries::upsert_product(
        conn,
        &CreateProduct {
            id: id.to_string(),
            name: format!("Test product {}", id),
            credits,
            kind,
        },
    )
    .expect("Failed to create test product")
}

/// Create a charged task already accepted by the provider under `prediction_id`
pub fn create_test_task(conn: &Connection, account_id: &str, cost: i64, prediction_id: &str) -> Task {
    let task = queries::create_task(
        conn,
        &CreateTask {
            account_id: account_id.to_string(),
            model: TEST_MODEL.to_string(),
            input: json!({"prompt": "a cat surfing"}),
            cost_credits: cost,
        },
    )
    .expect("Failed to create test task");
    queries::apply_credit_delta(conn, account_id, -cost, LedgerReason::TaskCharge, None, None)
        .expect("Failed to charge test task");
    assert!(queries::set_task_submitted(conn, &task.id, prediction_id).unwrap());
    queries::get_task_by_id(conn, &task.id).unwrap().unwrap()
}

pub fn balance(conn: &Connection, account_id: &str) -> i64 {
    queries::get_account_by_id(conn, account_id)
        .unwrap()
        .expect("account exists")
        .credits_balance
}

/// The cached balance must always equal the sum of the ledger
pub fn assert_ledger_consistent(conn: &Connection, account_id: &str) {
    let sum = queries::sum_ledger_deltas(conn, account_id).unwrap();
    assert_eq!(
        balance(conn, account_id),
        sum,
        "cached balance should equal the ledger sum"
    );
}

/// Ledger entries written by one provider event, oldest first
pub fn ledger_entries_for_event(conn: &Connection, event_id: &str) -> Vec<LedgerEntry> {
    let mut stmt = conn
        .prepare(
            "SELECT id, account_id, delta, balance_after, reason, note, event_id, created_at
             FROM ledger_entries WHERE event_id = ?1 ORDER BY rowid",
        )
        .unwrap();
    stmt.query_map([event_id], |row| {
        Ok(LedgerEntry {
            id: row.get(0)?,
            account_id: row.get(1)?,
            delta: row.get(2)?,
            balance_after: row.get(3)?,
            reason: row.get::<_, String>(4)?.parse().unwrap(),
            note: row.get(5)?,
            event_id: row.get(6)?,
            created_at: row.get(7)?,
        })
    })
    .unwrap()
    .collect::<Result<_, _>>()
    .unwrap()
}

/// Every order of an account, oldest first
pub fn orders_for_account(conn: &Connection, account_id: &str) -> Vec<Order> {
    let mut stmt = conn
        .prepare(
            "SELECT id, account_id, provider, provider_order_id, product_id, amount_cents, currency,
                    credits, kind, parent_order_id, event_id, created_at
             FROM orders WHERE account_id = ?1 ORDER BY created_at, rowid",
        )
        .unwrap();
    stmt.query_map([account_id], |row| {
        Ok(Order {
            id: row.get(0)?,
            account_id: row.get(1)?,
            provider: row.get(2)?,
            provider_order_id: row.get(3)?,
            product_id: row.get(4)?,
            amount_cents: row.get(5)?,
            currency: row.get(6)?,
            credits: row.get(7)?,
            kind: row.get::<_, String>(8)?.parse().unwrap(),
            parent_order_id: row.get(9)?,
            event_id: row.get(10)?,
            created_at: row.get(11)?,
        })
    })
    .unwrap()
    .collect::<Result<_, _>>()
    .unwrap()
}

// ============ Webhook payloads ============

pub fn checkout_completed(
    event_id: &str,
    order_id: &str,
    product_id: &str,
    account_id: &str,
    amount: i64,
) -> Value {
    json!({
        "id": event_id,
        "eventType": "checkout.completed",
        "created_at": 1728734325927i64,
        "object": {
            "id": format!("ch_{}", order_id),
            "object": "checkout",
            "order": {"id": order_id, "amount": amount, "currency": "USD", "status": "paid"},
            "product": {"id": product_id, "price": amount, "currency": "USD"},
            "customer": {"id": "cust_test", "email": "buyer@example.com"},
            "metadata": {"user_id": account_id}
        }
    })
}

pub fn subscription_paid(event_id: &str, transaction_id: &str, product_id: &str, account_id: &str) -> Value {
    json!({
        "id": event_id,
        "eventType": "subscription.paid",
        "object": {
            "id": "sub_test",
            "object": "subscription",
            "product": {"id": product_id, "price": 999, "currency": "USD"},
            "customer": "cust_test",
            "last_transaction_id": transaction_id,
            "status": "active",
            "metadata": {"user_id": account_id}
        }
    })
}

pub fn refund_created(event_id: &str, refund_id: &str, order_id: &str, amount: i64) -> Value {
    json!({
        "id": event_id,
        "eventType": "refund.created",
        "object": {
            "id": refund_id,
            "object": "refund",
            "refund_amount": amount,
            "refund_currency": "USD",
            "order": {"id": order_id}
        }
    })
}

pub fn wavespeed_completed(prediction_id: &str, outputs: &[&str]) -> Value {
    json!({
        "id": prediction_id,
        "model": TEST_MODEL,
        "status": "completed",
        "outputs": outputs,
    })
}

pub fn wavespeed_failed(prediction_id: &str, error: &str) -> Value {
    json!({
        "id": prediction_id,
        "model": TEST_MODEL,
        "status": "failed",
        "outputs": [],
        "error": error,
    })
}

// ============ Signing ============

pub fn creem_signature(body: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

pub fn wavespeed_signature(webhook_id: &str, timestamp: &str, body: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(format!("{}.{}.", webhook_id, timestamp).as_bytes());
    mac.update(body);
    format!("v3,{}", hex::encode(mac.finalize().into_bytes()))
}

pub fn current_timestamp() -> String {
    chrono::Utc::now().timestamp().to_string()
}

// ============ Requests ============

pub fn creem_request(payload: &Value) -> Request<Body> {
    let body = serde_json::to_vec(payload).unwrap();
    Request::builder()
        .method("POST")
        .uri("/webhook/creem")
        .header("content-type", "application/json")
        .header("creem-signature", creem_signature(&body, CREEM_SECRET))
        .body(Body::from(body))
        .unwrap()
}

pub fn wavespeed_request(payload: &Value) -> Request<Body> {
    signed_wavespeed_request("/webhook/wavespeed", payload)
}

/// A WaveSpeed delivery to the URL we registered for `task_id` at submission
pub fn wavespeed_request_for_task(task_id: &str, payload: &Value) -> Request<Body> {
    signed_wavespeed_request(&format!("/webhook/wavespeed?task_id={}", task_id), payload)
}

fn signed_wavespeed_request(uri: &str, payload: &Value) -> Request<Body> {
    let body = serde_json::to_vec(payload).unwrap();
    let webhook_id = format!("msg_{}", uuid::Uuid::new_v4());
    let timestamp = current_timestamp();
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("webhook-id", &webhook_id)
        .header("webhook-timestamp", &timestamp)
        .header(
            "webhook-signature",
            wavespeed_signature(&webhook_id, &timestamp, &body, WAVESPEED_SECRET),
        )
        .body(Body::from(body))
        .unwrap()
}

pub fn api_request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("Authorization", format!("Bearer {}", API_TOKEN));
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&json).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

/// Send a request through a fresh copy of the router
pub async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

pub async fn send_json(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
    let (status, body) = send(state, request).await;
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

// ============ Mock WaveSpeed ============

/// Serve a stand-in WaveSpeed API that accepts every submission as `prediction_id`.
/// Returns the api base URL.
pub async fn spawn_mock_wavespeed(prediction_id: &'static str) -> String {
    let router = Router::new().route(
        "/api/v3/{*model}",
        post(move || async move {
            axum::Json(json!({
                "code": 200,
                "message": "success",
                "data": {"id": prediction_id, "status": "created", "outputs": []}
            }))
        }),
    );
    spawn_mock(router).await
}

/// Serve a stand-in WaveSpeed API that rejects every submission.
pub async fn spawn_rejecting_wavespeed() -> String {
    let router = Router::new().route(
        "/api/v3/{*model}",
        post(|| async { (StatusCode::BAD_REQUEST, axum::Json(json!({"code": 400, "message": "invalid input"}))) }),
    );
    spawn_mock(router).await
}

/// Serve a stand-in WaveSpeed API that answers 200 with a body we cannot read.
pub async fn spawn_garbled_wavespeed() -> String {
    let router = Router::new().route(
        "/api/v3/{*model}",
        post(|| async { (StatusCode::OK, "<html>upstream gateway</html>") }),
    );
    spawn_mock(router).await
}

async fn spawn_mock(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}/api/v3", addr)
}
