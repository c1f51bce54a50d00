use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub email: String,
    /// Cached sum of the account's ledger deltas
    pub credits_balance: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateAccount {
    pub email: String,
}

impl CreateAccount {
    pub fn validate(&self) -> Result<()> {
        let email = self.email.trim();
        if email.is_empty() {
            return Err(AppError::BadRequest("email is required".into()));
        }
        if email.len() > 254 || !email.contains('@') {
            return Err(AppError::BadRequest("email is not a valid address".into()));
        }
        Ok(())
    }
}

/// Account with its most recent ledger activity, as returned by the API.
#[derive(Debug, Clone, Serialize)]
pub struct AccountWithLedger {
    #[serde(flatten)]
    pub account: Account,
    pub ledger: Vec<super::LedgerEntry>,
}
