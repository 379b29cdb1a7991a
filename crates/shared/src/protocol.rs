use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{domain::BatchId, error::ApiError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitBatchRequest {
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitBatchResponse {
    pub batch_id: BatchId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStatusResponse {
    pub batch_id: BatchId,
    pub expected: u32,
    pub received: u32,
    pub status: crate::domain::BatchState,
}

/// One completed command, as published by the executor. Exactly one is
/// expected per submitted command, but delivery is at-least-once and
/// arrival order is unconstrained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEvent {
    pub batch_id: BatchId,
    pub command_index: u32,
    pub output: String,
    pub success: bool,
    pub emitted_at: DateTime<Utc>,
}

/// Messages a streaming client sends over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum StreamRequest {
    Join { batch_id: BatchId },
    Leave { batch_id: BatchId },
}

/// Messages pushed to a streaming client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum StreamEvent {
    Joined {
        batch_id: BatchId,
    },
    Result(ResultEvent),
    /// Published once per batch when every expected result has been
    /// recorded. Late subscribers that missed results still see this.
    BatchComplete {
        batch_id: BatchId,
        expected: u32,
        received: u32,
    },
    Error(ApiError),
}
