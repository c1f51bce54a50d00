use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

/// What happened to a recorded webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventOutcome {
    /// Claimed, settlement not yet finished (only visible inside the claiming transaction)
    Pending,
    /// Settlement applied
    Applied,
    /// Acknowledged but nothing to apply (unknown account, product, task...)
    Skipped,
}

/// A delivered provider event. `(provider, event_id)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEventRecord {
    pub provider: String,
    pub event_id: String,
    pub event_type: String,
    /// Order or task the event settled into
    pub entity_id: Option<String>,
    pub payload: String,
    pub outcome: EventOutcome,
    pub created_at: i64,
}
