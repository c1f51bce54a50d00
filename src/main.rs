use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use std::time::Duration;

use creditgate::config::Config;
use creditgate::db::{AppState, create_pool, init_db, queries};
use creditgate::generation::WaveSpeedClient;
use creditgate::handlers;
use creditgate::models::{CreateAccount, CreateProduct, ProductKind};
use creditgate::payments::CreemClient;

/// Timeout for outbound provider requests
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "creditgate")]
#[command(about = "Credit ledger and exactly-once webhook settlement")]
struct Cli {
    /// Seed the database with dev data (an account and sample products)
    #[arg(long)]
    seed: bool,

    /// Delete the database on exit (dev mode only, useful for fresh starts)
    #[arg(long)]
    ephemeral: bool,
}

/// Seeds the database with dev data for testing.
/// Only runs in dev mode and when the database is empty.
fn seed_dev_data(state: &AppState) {
    let conn = state.db.get().expect("Failed to get db connection for seeding");

    let count = queries::count_accounts(&conn).expect("Failed to count accounts");
    if count > 0 {
        tracing::info!("Database already has data, skipping seed");
        return;
    }

    tracing::info!("============================================");
    tracing::info!("SEEDING DEV DATA");
    tracing::info!("============================================");

    let account = queries::create_account(
        &conn,
        &CreateAccount {
            email: "dev@creditgate.local".to_string(),
        },
        state.signup_credits,
    )
    .expect("Failed to create dev account");

    tracing::info!("Account: {} (id: {}, credits: {})", account.email, account.id, account.credits_balance);

    let products = [
        ("prod_dev_starter", "Starter Pack", 100, ProductKind::OneTime),
        ("prod_dev_monthly", "Monthly Plan", 500, ProductKind::Subscription),
    ];
    for (id, name, credits, kind) in products {
        let product = queries::upsert_product(
            &conn,
            &CreateProduct {
                id: id.to_string(),
                name: name.to_string(),
                credits,
                kind,
            },
        )
        .expect("Failed to create dev product");
        tracing::info!("Product: {} (id: {}, credits: {}, {})", product.name, product.id, product.credits, product.kind.as_ref());
    }

    tracing::info!("============================================");
    tracing::info!("DEV DATA SEEDED SUCCESSFULLY");
    tracing::info!("============================================");

    println!();
    println!("--- COPY FROM HERE ---");
    println!("  api_token: {}", state.api_token);
    println!("  account_id: {}", account.id);
    println!("--- END COPY ---");
    println!();
}

fn purge_webhook_events(state: &AppState, retention_days: i64) {
    match state.db.get() {
        Ok(conn) => match queries::purge_old_webhook_events(&conn, retention_days) {
            Ok(count) if count > 0 => {
                tracing::info!("Purged {} webhook events older than {} days", count, retention_days);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Failed to purge old webhook events: {}", e);
            }
        },
        Err(e) => {
            tracing::warn!("Failed to get db connection for cleanup: {}", e);
        }
    }
}

/// Spawns a background task that purges webhook events past retention.
/// Runs every hour.
fn spawn_cleanup_task(state: AppState, retention_days: i64) {
    tokio::spawn(async move {
        let interval = Duration::from_secs(60 * 60);

        loop {
            tokio::time::sleep(interval).await;
            purge_webhook_events(&state, retention_days);
        }
    });

    tracing::info!("Background cleanup task started (runs every hour)");
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "creditgate=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    if config.dev_mode {
        tracing::info!("Running in DEVELOPMENT mode");
    }
    if config.creem_webhook_secret.is_empty() {
        tracing::warn!("CREEM_WEBHOOK_SECRET not set: Creem webhooks will be refused");
    }
    if config.wavespeed_webhook_secret.is_empty() {
        tracing::warn!("WAVESPEED_WEBHOOK_SECRET not set: tasks cannot be submitted");
    }

    let db_pool = create_pool(&config.database_path).expect("Failed to create database pool");
    {
        let conn = db_pool.get().expect("Failed to get connection");
        init_db(&conn).expect("Failed to initialize database");
    }

    let http = reqwest::Client::builder()
        .timeout(PROVIDER_TIMEOUT)
        .build()
        .expect("Failed to build HTTP client");

    let state = AppState {
        db: db_pool,
        base_url: config.base_url.clone(),
        api_token: config.api_token.clone(),
        signup_credits: config.signup_credits,
        creem: CreemClient::new(config.creem_webhook_secret.clone()),
        wavespeed: WaveSpeedClient::new(
            http,
            config.wavespeed_api_key.clone(),
            config.wavespeed_api_url.clone(),
            config.wavespeed_webhook_secret.clone(),
        ),
    };

    // 0 = keep webhook events forever
    if config.webhook_event_retention_days > 0 {
        purge_webhook_events(&state, config.webhook_event_retention_days);
        spawn_cleanup_task(state.clone(), config.webhook_event_retention_days);
    }

    if cli.seed {
        if !config.dev_mode {
            tracing::warn!("--seed flag ignored: not in dev mode (set CREDITGATE_ENV=dev)");
        } else {
            seed_dev_data(&state);
        }
    }

    let app = handlers::app(state).layer(TraceLayer::new_for_http());

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    let cleanup_on_exit = cli.ephemeral && config.dev_mode;
    let db_path = config.database_path.clone();

    if cleanup_on_exit {
        tracing::info!("EPHEMERAL MODE: database will be deleted on exit");
    }

    tracing::info!("creditgate listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Failed to start server");

    if cleanup_on_exit {
        tracing::info!("Cleaning up ephemeral database...");
        if let Err(e) = std::fs::remove_file(&db_path) {
            tracing::warn!("Failed to remove {}: {}", db_path, e);
        } else {
            tracing::info!("Removed {}", db_path);
        }
        let _ = std::fs::remove_file(format!("{}-wal", db_path));
        let _ = std::fs::remove_file(format!("{}-shm", db_path));
        tracing::info!("Ephemeral cleanup complete");
    }
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!("Shutdown signal received, stopping server...");
}
