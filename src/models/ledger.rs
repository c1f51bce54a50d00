use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

/// Why a ledger entry was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LedgerReason {
    SignupBonus,
    Purchase,
    Renewal,
    Refund,
    TaskCharge,
    TaskRefund,
    Adjustment,
}

/// Append-only record of a credit balance change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub account_id: String,
    pub delta: i64,
    pub balance_after: i64,
    pub reason: LedgerReason,
    pub note: Option<String>,
    /// Webhook event that caused this entry, if any
    pub event_id: Option<String>,
    pub created_at: i64,
}
