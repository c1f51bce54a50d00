mod from_row;
mod schema;
pub mod queries;

pub use schema::init_db;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::generation::WaveSpeedClient;
use crate::payments::CreemClient;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Application state holding the database pool and provider clients
#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    /// Base URL for provider callbacks (e.g., https://api.example.com)
    pub base_url: String,
    /// Bearer token for the accounts/tasks API
    pub api_token: String,
    /// Credits granted to new accounts
    pub signup_credits: i64,
    pub creem: CreemClient,
    pub wavespeed: WaveSpeedClient,
}

pub fn create_pool(database_path: &str) -> Result<DbPool, r2d2::Error> {
    let manager = SqliteConnectionManager::file(database_path).with_init(|conn| {
        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
    });
    Pool::builder().max_size(10).build(manager)
}
