use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    /// Charged, not yet accepted by the provider
    Pending,
    /// Accepted by the provider, waiting for the completion webhook
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A video/audio generation task submitted to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub account_id: String,
    pub model: String,
    /// Provider input (prompt, image url, duration, ...) as JSON
    pub input: serde_json::Value,
    pub cost_credits: i64,
    pub status: TaskStatus,
    /// Provider's prediction id, set once the provider accepts the task
    pub provider_task_id: Option<String>,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutput {
    pub id: String,
    pub task_id: String,
    pub url: String,
    pub position: i64,
    pub event_id: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskWithOutputs {
    #[serde(flatten)]
    pub task: Task,
    pub outputs: Vec<TaskOutput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTask {
    pub account_id: String,
    /// Provider model path, e.g. "wavespeed-ai/wan-2.1/t2v-480p"
    pub model: String,
    pub input: serde_json::Value,
    pub cost_credits: i64,
}

impl CreateTask {
    pub fn validate(&self) -> Result<()> {
        if self.account_id.trim().is_empty() {
            return Err(AppError::BadRequest("account_id is required".into()));
        }
        let model = self.model.trim();
        if model.is_empty() {
            return Err(AppError::BadRequest("model is required".into()));
        }
        // Model is interpolated into the provider URL path
        if model.starts_with('/')
            || model.contains("..")
            || !model
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.'))
        {
            return Err(AppError::BadRequest("model contains invalid characters".into()));
        }
        if !self.input.is_object() {
            return Err(AppError::BadRequest("input must be a JSON object".into()));
        }
        if self.cost_credits <= 0 {
            return Err(AppError::BadRequest("cost_credits must be positive".into()));
        }
        Ok(())
    }
}
