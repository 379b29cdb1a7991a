use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::BatchId;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    NotFound,
    Validation,
    Dispatch,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Failures scoped to a single batch. Nothing here is fatal to the
/// process; state for other batches stays intact.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("batch must contain at least one non-blank command")]
    EmptyBatch,
    #[error("unknown batch {0}")]
    UnknownBatch(BatchId),
    #[error("executor refused batch {0}")]
    ExecutorRefused(BatchId),
    #[error("executor unreachable: {0}")]
    ExecutorUnreachable(String),
}

impl From<&DispatchError> for ApiError {
    fn from(value: &DispatchError) -> Self {
        let code = match value {
            DispatchError::EmptyBatch => ErrorCode::Validation,
            DispatchError::UnknownBatch(_) => ErrorCode::NotFound,
            DispatchError::ExecutorRefused(_) | DispatchError::ExecutorUnreachable(_) => {
                ErrorCode::Dispatch
            }
        };
        ApiError::new(code, value.to_string())
    }
}
